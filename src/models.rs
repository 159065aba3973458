//! Input/output DTOs and schema-bearing types
//!
//! Defines the data structures used in tool contracts. Input types derive
//! `JsonSchema` so `tools/list` can advertise their schemas.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::accounts::AccountFamily;

/// Maximum messages returned by list/search tools
pub const MAX_RESULTS_LIMIT: usize = 100;

/// Metadata included in all tool responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with a human-readable summary and execution
/// metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEnvelope<T> {
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Account metadata (no credentials)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub family: AccountFamily,
    /// Mailbox address or login name
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Message summary for list and search results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Provider-specific message identifier, accepted by detail/archive tools
    pub message_id: String,
    pub date: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub unread: bool,
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`, `image/jpeg`)
    pub content_type: String,
    pub size_bytes: usize,
    /// Part ID for MIME structure (e.g., `1`, `2`, `3.1`)
    pub part_id: String,
}

/// Full message detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDetail {
    pub message_id: String,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// Flags (IMAP) or labels (Gmail)
    pub labels: Vec<String>,
    /// Plain text body, converted from HTML when no text part exists
    pub body_text: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Result of a send operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider-assigned id of the sent message, when available
    pub message_id: Option<String>,
    pub recipients: usize,
}

/// Outcome of a connectivity probe
///
/// `account_type` is the registered family when the account exists, and
/// `gmail` when it does not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResult {
    pub success: bool,
    pub account_name: String,
    pub account_type: AccountFamily,
    pub message: String,
}

/// One constructed pool entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolEntryInfo {
    pub account_id: String,
    pub created_at: String,
}

/// Pool contents for one family
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FamilyPoolStatus {
    pub count: usize,
    /// Pooled identities in ascending order
    pub accounts: Vec<String>,
    pub entries: Vec<PoolEntryInfo>,
}

/// Snapshot of both handler pools
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub gmail: FamilyPoolStatus,
    pub imap: FamilyPoolStatus,
}

/// Listing parameters passed to provider handlers
#[derive(Debug, Clone)]
pub struct ListQuery {
    /// IMAP mailbox; Gmail always lists the inbox
    pub mailbox: Option<String>,
    pub max_results: usize,
    pub unread_only: bool,
}

/// Search parameters passed to provider handlers
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
}

/// Outgoing message passed to provider handlers
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html: bool,
}

/// Input: no arguments
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct EmptyInput {}

/// Input: account only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountOnlyInput {
    /// Account identifier
    #[serde(alias = "accountName")]
    pub account_id: String,
}

/// Input: list recent messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListEmailsInput {
    /// Account identifier
    #[serde(alias = "accountName")]
    pub account_id: String,
    /// Mailbox to list (IMAP accounts only, defaults to `INBOX`)
    pub mailbox: Option<String>,
    /// Maximum messages to return (1..100, default 10)
    #[serde(default = "default_max_results", alias = "maxResults")]
    pub max_results: usize,
    /// Only return unread messages
    #[serde(default, alias = "unreadOnly")]
    pub unread_only: bool,
}

/// Input: search messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchEmailsInput {
    /// Account identifier
    #[serde(alias = "accountName")]
    pub account_id: String,
    /// Search text (Gmail query syntax for Gmail accounts, full text for IMAP)
    pub query: String,
    /// Maximum messages to return (1..100, default 10)
    #[serde(default = "default_max_results", alias = "maxResults")]
    pub max_results: usize,
}

/// Input: get message detail
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetEmailDetailInput {
    /// Account identifier
    #[serde(alias = "accountName")]
    pub account_id: String,
    /// Message identifier from a list or search result
    #[serde(alias = "messageId")]
    pub message_id: String,
    /// Maximum body characters (100..100000, default 20000)
    #[serde(default = "default_body_max_chars", alias = "bodyMaxChars")]
    pub body_max_chars: usize,
}

/// Input: send a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Account identifier
    #[serde(alias = "accountName")]
    pub account_id: String,
    /// Recipient addresses
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Send `body` as HTML instead of plain text
    #[serde(default)]
    pub html: bool,
}

/// Input: archive a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ArchiveEmailInput {
    /// Account identifier
    #[serde(alias = "accountName")]
    pub account_id: String,
    /// Message identifier from a list or search result
    #[serde(alias = "messageId")]
    pub message_id: String,
}

fn default_max_results() -> usize {
    10
}

/// Large enough for most plain text mail while bounding response size
fn default_body_max_chars() -> usize {
    20_000
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ListEmailsInput, SendEmailInput};

    #[test]
    fn list_input_applies_defaults_and_aliases() {
        let input: ListEmailsInput =
            serde_json::from_value(json!({ "accountName": "work" })).expect("deserialize");
        assert_eq!(input.account_id, "work");
        assert_eq!(input.max_results, 10);
        assert!(!input.unread_only);
        assert!(input.mailbox.is_none());
    }

    #[test]
    fn send_input_requires_recipients() {
        let err = serde_json::from_value::<SendEmailInput>(
            json!({ "account_id": "work", "subject": "s", "body": "b" }),
        )
        .expect_err("missing to must fail");
        assert!(err.to_string().contains("to"));
    }
}
