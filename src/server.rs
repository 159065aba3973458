//! Request dispatcher with tool handlers
//!
//! Routes validated JSON-RPC requests to the MCP methods this server
//! implements and executes tool calls against pooled account handlers.
//! Every request yields exactly one response; tool failures are converted to
//! JSON-RPC errors at this boundary.

use std::sync::Arc;
use std::time::Instant;

use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::errors::{AppError, AppResult};
use crate::manager::ConnectionManager;
use crate::models::{
    AccountOnlyInput, ArchiveEmailInput, EmptyInput, GetEmailDetailInput, ListEmailsInput,
    ListQuery, MAX_RESULTS_LIMIT, Meta, OutgoingMessage, SearchEmailsInput, SearchQuery,
    SendEmailInput, ToolEnvelope,
};
use crate::redact::{self, DEFAULT_SENSITIVE_FIELDS};
use crate::rpc::{self, INVALID_PARAMS, METHOD_NOT_FOUND, RpcError, RpcRequest, RpcResponse};

/// MCP protocol revision announced by `initialize`
const PROTOCOL_VERSION: &str = "2024-11-05";

/// A tool invocation with typed arguments
#[derive(Debug)]
pub enum ToolCall {
    ListAccounts,
    TestConnection(AccountOnlyInput),
    ListEmails(ListEmailsInput),
    SearchEmails(SearchEmailsInput),
    GetEmailDetail(GetEmailDetailInput),
    SendEmail(SendEmailInput),
    ArchiveEmail(ArchiveEmailInput),
    GetUnreadCount(AccountOnlyInput),
    GetPoolStatus,
}

impl ToolCall {
    /// Resolve a tool name and deserialize its arguments
    ///
    /// Unknown names map to `method not found`; arguments that do not match
    /// the tool's input type map to `invalid params`.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, RpcError> {
        let call = match name {
            "list_accounts" => {
                args::<EmptyInput>(arguments)?;
                Self::ListAccounts
            }
            "test_connection" => Self::TestConnection(args(arguments)?),
            "list_emails" => Self::ListEmails(args(arguments)?),
            "search_emails" => Self::SearchEmails(args(arguments)?),
            "get_email_detail" => Self::GetEmailDetail(args(arguments)?),
            "send_email" => Self::SendEmail(args(arguments)?),
            "archive_email" => Self::ArchiveEmail(args(arguments)?),
            "get_unread_count" => Self::GetUnreadCount(args(arguments)?),
            "get_pool_status" => {
                args::<EmptyInput>(arguments)?;
                Self::GetPoolStatus
            }
            other => {
                return Err(RpcError::new(
                    METHOD_NOT_FOUND,
                    format!("Unknown tool: {other}"),
                ));
            }
        };
        Ok(call)
    }

    /// Check argument values that the input types cannot express
    ///
    /// Runs before any handler is resolved; failures here are `invalid
    /// params`, everything after is an execution failure.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            Self::ListAccounts | Self::GetPoolStatus => Ok(()),
            Self::TestConnection(input) | Self::GetUnreadCount(input) => {
                validate_account_id(&input.account_id)
            }
            Self::ListEmails(input) => {
                validate_account_id(&input.account_id)?;
                validate_range(input.max_results, 1, MAX_RESULTS_LIMIT, "max_results")
            }
            Self::SearchEmails(input) => {
                validate_account_id(&input.account_id)?;
                validate_range(input.max_results, 1, MAX_RESULTS_LIMIT, "max_results")?;
                if input.query.trim().is_empty() {
                    return Err(AppError::invalid("query must not be empty"));
                }
                Ok(())
            }
            Self::GetEmailDetail(input) => {
                validate_account_id(&input.account_id)?;
                validate_range(input.body_max_chars, 100, 100_000, "body_max_chars")
            }
            Self::SendEmail(input) => validate_account_id(&input.account_id),
            Self::ArchiveEmail(input) => validate_account_id(&input.account_id),
        }
    }
}

fn args<T: DeserializeOwned>(arguments: Value) -> Result<T, RpcError> {
    serde_json::from_value(arguments)
        .map_err(|e| AppError::invalid(format!("invalid arguments: {e}")).to_rpc_error())
}

/// Tool descriptors advertised by `tools/list`
pub fn tool_definitions() -> Vec<Value> {
    vec![
        tool::<EmptyInput>("list_accounts", "List configured mail accounts"),
        tool::<AccountOnlyInput>(
            "test_connection",
            "Verify that an account can connect and authenticate",
        ),
        tool::<ListEmailsInput>("list_emails", "List recent messages, newest first"),
        tool::<SearchEmailsInput>("search_emails", "Search messages in an account"),
        tool::<GetEmailDetailInput>(
            "get_email_detail",
            "Get headers, body text and attachment metadata for one message",
        ),
        tool::<SendEmailInput>("send_email", "Send a message from an account"),
        tool::<ArchiveEmailInput>("archive_email", "Move a message out of the inbox"),
        tool::<AccountOnlyInput>("get_unread_count", "Count unread messages in the inbox"),
        tool::<EmptyInput>(
            "get_pool_status",
            "Show which accounts currently hold a pooled connection",
        ),
    ]
}

fn tool<T: JsonSchema>(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": schemars::schema_for!(T),
    })
}

/// Mail accounts MCP server
///
/// Cheap to clone; all clones share one connection manager.
#[derive(Clone)]
pub struct MailServer {
    manager: Arc<ConnectionManager>,
}

impl MailServer {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Handle one parsed JSON value and produce its response
    pub async fn handle(&self, value: Value) -> RpcResponse {
        let RpcRequest { id, method, params } = match rpc::validate(value) {
            Ok(request) => request,
            Err(response) => {
                tracing::warn!("rejected invalid request");
                return response;
            }
        };
        tracing::debug!(%method, %id, "request received");

        match method.as_str() {
            "initialize" => RpcResponse::success(id, initialize_result()),
            "ping" => RpcResponse::success(id, json!({})),
            "tools/list" => RpcResponse::success(id, json!({ "tools": tool_definitions() })),
            "resources/list" => RpcResponse::success(id, json!({ "resources": [] })),
            "tools/call" => match self.tools_call(params).await {
                Ok(result) => RpcResponse::success(id, result),
                Err(error) => RpcResponse::failure(id, error),
            },
            other => RpcResponse::failure(
                id,
                RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {other}")),
            ),
        }
    }

    async fn tools_call(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let mut params = match params {
            Some(Value::Object(params)) => params,
            _ => return Err(invalid_params("tools/call requires an object with a tool name")),
        };
        let name = match params.remove("name") {
            Some(Value::String(name)) => name,
            _ => return Err(invalid_params("tool name is required")),
        };
        let arguments = match params.remove("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(arguments) => arguments,
        };
        tracing::debug!(
            tool = %name,
            arguments = %redact::mask(&arguments, DEFAULT_SENSITIVE_FIELDS),
            "tool call"
        );

        let call = ToolCall::parse(&name, arguments)?;
        call.validate().map_err(|e| {
            tracing::debug!(tool = %name, error = %e, "tool arguments rejected");
            e.to_rpc_error()
        })?;
        let started = Instant::now();
        self.execute(call, started).await.map_err(|e| {
            tracing::warn!(tool = %name, error = %e, "tool execution failed");
            e.to_execution_error()
        })
    }

    async fn execute(&self, call: ToolCall, started: Instant) -> AppResult<Value> {
        match call {
            ToolCall::ListAccounts => {
                let data = self.manager.directory().summaries();
                finalize_tool(
                    started,
                    format!("{} account(s) configured", data.len()),
                    data,
                )
            }
            ToolCall::TestConnection(input) => {
                let result = self.manager.test_connection(&input.account_id).await;
                finalize_tool(started, result.message.clone(), result)
            }
            ToolCall::ListEmails(input) => {
                let handler = self.manager.handler_for_account(&input.account_id).await?;
                let messages = handler
                    .list_messages(
                        &input.account_id,
                        ListQuery {
                            mailbox: input.mailbox,
                            max_results: input.max_results,
                            unread_only: input.unread_only,
                        },
                    )
                    .await?;
                finalize_tool(started, format!("{} message(s)", messages.len()), messages)
            }
            ToolCall::SearchEmails(input) => {
                let handler = self.manager.handler_for_account(&input.account_id).await?;
                let messages = handler
                    .search_messages(
                        &input.account_id,
                        SearchQuery {
                            query: input.query,
                            max_results: input.max_results,
                        },
                    )
                    .await?;
                finalize_tool(
                    started,
                    format!("{} matching message(s)", messages.len()),
                    messages,
                )
            }
            ToolCall::GetEmailDetail(input) => {
                let handler = self.manager.handler_for_account(&input.account_id).await?;
                let detail = handler
                    .get_message(&input.account_id, &input.message_id, input.body_max_chars)
                    .await?;
                finalize_tool(started, "Message retrieved".to_owned(), detail)
            }
            ToolCall::SendEmail(input) => {
                let handler = self.manager.handler_for_account(&input.account_id).await?;
                let receipt = handler
                    .send_message(
                        &input.account_id,
                        OutgoingMessage {
                            to: input.to,
                            cc: input.cc,
                            bcc: input.bcc,
                            subject: input.subject,
                            body: input.body,
                            html: input.html,
                        },
                    )
                    .await?;
                finalize_tool(
                    started,
                    format!("Message sent to {} recipient(s)", receipt.recipients),
                    receipt,
                )
            }
            ToolCall::ArchiveEmail(input) => {
                let handler = self.manager.handler_for_account(&input.account_id).await?;
                handler
                    .archive_message(&input.account_id, &input.message_id)
                    .await?;
                finalize_tool(
                    started,
                    "Message archived".to_owned(),
                    json!({ "message_id": input.message_id, "archived": true }),
                )
            }
            ToolCall::GetUnreadCount(input) => {
                let handler = self.manager.handler_for_account(&input.account_id).await?;
                let unread = handler.unread_count(&input.account_id).await?;
                finalize_tool(
                    started,
                    format!("{unread} unread message(s)"),
                    json!({ "account_id": input.account_id, "unread": unread }),
                )
            }
            ToolCall::GetPoolStatus => {
                let status = self.manager.pool_status();
                finalize_tool(
                    started,
                    format!(
                        "{} gmail and {} imap handler(s) pooled",
                        status.gmail.count, status.imap.count
                    ),
                    status,
                )
            }
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {}, "resources": {} },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Mail accounts server for Gmail API and IMAP mailboxes. Call test_connection before operating on an account.",
    })
}

fn duration_ms(started: Instant) -> u64 {
    let ms = started.elapsed().as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

/// Wrap tool data in the standard envelope and MCP tool result shape
fn finalize_tool<T: Serialize>(started: Instant, summary: String, data: T) -> AppResult<Value> {
    let envelope = ToolEnvelope {
        summary,
        data,
        meta: Meta::now(duration_ms(started)),
    };
    let structured = serde_json::to_value(&envelope)
        .map_err(|e| AppError::Internal(format!("failed to serialize tool result: {e}")))?;
    Ok(json!({
        "content": [{ "type": "text", "text": structured.to_string() }],
        "structuredContent": structured,
        "isError": false,
    }))
}

fn invalid_params(reason: &str) -> RpcError {
    RpcError::new(INVALID_PARAMS, "Invalid params").with_data(json!({
        "code": "invalid_input",
        "message": reason,
    }))
}

/// Validate account_id format
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if account_id.is_empty() || account_id.len() > 64 {
        return Err(AppError::invalid("account_id must be 1..64 characters"));
    }
    if !account_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::invalid("account_id must match [A-Za-z0-9_-]+"));
    }
    Ok(())
}

/// Validate numeric value in range
fn validate_range(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::{MailServer, validate_account_id};
    use crate::accounts::AccountDirectory;
    use crate::handler::HandlerFactory;
    use crate::manager::ConnectionManager;
    use crate::rpc::{INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND};
    use crate::test_support::{MockFactory, gmail_descriptor, imap_descriptor};

    fn server_with(factory: &Arc<MockFactory>) -> MailServer {
        let directory = Arc::new(AccountDirectory::new());
        directory.add_account("acct1", gmail_descriptor());
        directory.add_account("work", imap_descriptor());
        let factory: Arc<dyn HandlerFactory> = Arc::clone(factory) as Arc<dyn HandlerFactory>;
        MailServer::new(Arc::new(ConnectionManager::new(directory, factory)))
    }

    fn call(id: i64, name: &str, arguments: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        })
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server
            .handle(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": { "name": "nonexistent_tool" }
            }))
            .await;

        assert_eq!(response.id, json!(1));
        let error = response.error.expect("error");
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert!(error.message.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server
            .handle(json!({ "jsonrpc": "2.0", "id": "x", "method": "prompts/list" }))
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert_eq!(error.message, "Method not found: prompts/list");
        assert_eq!(response.id, json!("x"));
    }

    #[tokio::test]
    async fn invalid_envelope_is_invalid_request() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server.handle(json!({ "method": "tools/list" })).await;
        assert_eq!(response.id, json!(0));
        assert_eq!(response.error.expect("error").code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn initialize_and_tools_list() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let init = server
            .handle(json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }))
            .await;
        let result = init.result.expect("result");
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert!(result["capabilities"]["tools"].is_object());

        let list = server
            .handle(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
            .await;
        let tools = list.result.expect("result")["tools"].clone();
        let names: Vec<&str> = tools
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names.len(), 9);
        assert!(names.contains(&"get_pool_status"));
        assert!(tools[2]["inputSchema"]["properties"]["max_results"].is_object());
    }

    #[tokio::test]
    async fn list_emails_returns_envelope() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server
            .handle(call(3, "list_emails", json!({ "account_id": "work", "max_results": 2 })))
            .await;
        let result = response.result.expect("result");
        assert_eq!(result["isError"], false);
        assert_eq!(result["structuredContent"]["summary"], "2 message(s)");
        assert_eq!(
            result["structuredContent"]["data"][0]["message_id"],
            "work-1"
        );
        assert!(result["structuredContent"]["meta"]["duration_ms"].is_u64());
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn execution_failure_is_internal_error_with_data() {
        let factory = Arc::new(MockFactory::new());
        factory.set_fail_construction(true);
        let server = server_with(&factory);

        let response = server
            .handle(call(4, "get_unread_count", json!({ "account_id": "work" })))
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.message, "Tool execution failed");
        let data = error.data.expect("data");
        assert_eq!(data["code"], "configuration");
        assert!(data["message"].as_str().expect("message").contains("MAIL_MCP_SECRET_KEY"));
    }

    #[tokio::test]
    async fn unknown_account_is_reported_as_execution_failure() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server
            .handle(call(5, "get_unread_count", json!({ "account_id": "ghost" })))
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.data.expect("data")["code"], "account_not_found");
    }

    #[tokio::test]
    async fn handler_errors_are_execution_failures_whatever_their_kind() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server
            .handle(call(
                13,
                "get_email_detail",
                json!({ "account_id": "acct1", "message_id": "missing" }),
            ))
            .await;
        let error = response.error.expect("error");
        assert_eq!(error.code, INTERNAL_ERROR);
        assert_eq!(error.message, "Tool execution failed");
        let data = error.data.expect("data");
        assert_eq!(data["code"], "invalid_input");
        assert!(data["message"].as_str().expect("message").contains("message not found"));
    }

    #[tokio::test]
    async fn bad_arguments_are_invalid_params() {
        let server = server_with(&Arc::new(MockFactory::new()));

        let missing = server.handle(call(6, "list_emails", json!({}))).await;
        assert_eq!(missing.error.expect("error").code, INVALID_PARAMS);

        let out_of_range = server
            .handle(call(7, "list_emails", json!({ "account_id": "work", "max_results": 0 })))
            .await;
        assert_eq!(out_of_range.error.expect("error").code, INVALID_PARAMS);

        let no_name = server
            .handle(json!({ "jsonrpc": "2.0", "id": 8, "method": "tools/call", "params": {} }))
            .await;
        assert_eq!(no_name.error.expect("error").code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn probe_then_operation_uses_one_handler() {
        let factory = Arc::new(MockFactory::new());
        let server = server_with(&factory);

        let probe = server
            .handle(call(9, "test_connection", json!({ "accountName": "acct1" })))
            .await;
        let data = probe.result.expect("result")["structuredContent"]["data"].clone();
        assert_eq!(data["success"], true);
        assert_eq!(data["accountName"], "acct1");
        assert_eq!(data["accountType"], "gmail");

        let unread = server
            .handle(call(10, "get_unread_count", json!({ "account_id": "acct1" })))
            .await;
        assert_eq!(
            unread.result.expect("result")["structuredContent"]["data"]["unread"],
            7
        );
        assert_eq!(factory.gmail_constructions(), 1);

        let status = server.handle(call(11, "get_pool_status", json!({}))).await;
        let data = status.result.expect("result")["structuredContent"]["data"].clone();
        assert_eq!(data["gmail"]["count"], 1);
        assert_eq!(data["gmail"]["accounts"], json!(["acct1"]));
        assert_eq!(data["imap"]["count"], 0);
    }

    #[tokio::test]
    async fn list_accounts_hides_credentials() {
        let server = server_with(&Arc::new(MockFactory::new()));
        let response = server.handle(call(12, "list_accounts", Value::Null)).await;
        let result = response.result.expect("result");
        assert_eq!(result["structuredContent"]["summary"], "2 account(s) configured");
        let text = result.to_string();
        assert!(!text.contains("cs-value-123"));
        assert!(!text.contains("rt-value-456"));
    }

    #[test]
    fn account_id_validation() {
        validate_account_id("work_2").expect("valid");
        assert!(validate_account_id("").is_err());
        assert!(validate_account_id("bad id").is_err());
    }
}
