//! Line-delimited JSON-RPC transport
//!
//! Reads one JSON value per line, dispatches each request on its own task,
//! and writes responses through a single writer task so lines never
//! interleave. Responses may be written out of request order.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::errors::{AppError, AppResult};
use crate::rpc::{self, RpcResponse};
use crate::server::MailServer;

/// Serve requests from `reader` until EOF
///
/// Blank lines are skipped. Every other line produces exactly one response
/// line; lines that are not JSON (including non-UTF-8 bytes) get a
/// parse-error response. Only a failing read stops the loop early. At EOF
/// the in-flight requests are awaited before returning.
pub async fn serve<R, W>(mut reader: R, writer: W, server: MailServer) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<RpcResponse>();
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut tasks = JoinSet::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| AppError::Internal(format!("failed to read request: {e}")))?;
        if read == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match serde_json::from_slice::<Value>(&line) {
            Ok(value) => {
                let server = server.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    let response = dispatch(server, value).await;
                    // the writer only goes away after every sender is dropped
                    let _ = tx.send(response);
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "unparseable request line");
                let _ = tx.send(RpcResponse::parse_error());
            }
        }

        while let Some(finished) = tasks.try_join_next() {
            log_task_failure(finished);
        }
    }

    tracing::debug!(in_flight = tasks.len(), "input closed, draining requests");
    while let Some(finished) = tasks.join_next().await {
        log_task_failure(finished);
    }
    drop(tx);

    writer_task
        .await
        .map_err(|e| AppError::Internal(format!("response writer task failed: {e}")))?
}

/// Handle one request, answering with an execution failure if handling panics
async fn dispatch(server: MailServer, value: Value) -> RpcResponse {
    let id = rpc::response_id(&value);
    AssertUnwindSafe(server.handle(value))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!(%id, "request handler panicked");
            let error = AppError::Internal("request handler panicked".to_owned());
            RpcResponse::failure(id, error.to_execution_error())
        })
}

fn log_task_failure(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "request task failed");
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<RpcResponse>) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response)
            .map_err(|e| AppError::Internal(format!("failed to serialize response: {e}")))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| AppError::Internal(format!("failed to write response: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("failed to flush response: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};
    use tokio::io::AsyncReadExt;

    use super::serve;
    use crate::accounts::AccountDirectory;
    use crate::handler::HandlerFactory;
    use crate::manager::ConnectionManager;
    use crate::server::MailServer;
    use crate::test_support::{MockFactory, gmail_descriptor};

    async fn run(input: &str) -> Vec<Value> {
        run_bytes(input.as_bytes()).await
    }

    async fn run_bytes(input: &[u8]) -> Vec<Value> {
        let directory = Arc::new(AccountDirectory::new());
        directory.add_account("acct1", gmail_descriptor());
        let factory: Arc<dyn HandlerFactory> = Arc::new(MockFactory::new());
        let server = MailServer::new(Arc::new(ConnectionManager::new(directory, factory)));

        let (mut client, server_end) = tokio::io::duplex(1 << 16);
        serve(input, server_end, server)
            .await
            .expect("serve completes");

        let mut output = String::new();
        client
            .read_to_string(&mut output)
            .await
            .expect("read output");
        output
            .lines()
            .map(|line| serde_json::from_str(line).expect("each line is JSON"))
            .collect()
    }

    #[tokio::test]
    async fn non_json_line_yields_single_parse_error() {
        let responses = run("this is not json\n").await;
        assert_eq!(
            responses,
            vec![json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": "Parse error" }
            })]
        );
    }

    #[tokio::test]
    async fn non_utf8_line_does_not_stop_the_loop() {
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n");
        let responses = run_bytes(&input).await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[1]["id"], 1);
        assert_eq!(responses[1]["result"], json!({}));
    }

    #[tokio::test]
    async fn panicking_handler_still_gets_a_response() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"tools/call\",\"params\":{\"name\":\"archive_email\",\"arguments\":{\"account_id\":\"acct1\",\"message_id\":\"panic\"}}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":6,\"method\":\"ping\"}\n",
        );
        let responses = run(input).await;
        assert_eq!(responses.len(), 2);

        let failed = responses
            .iter()
            .find(|r| r["id"] == 5)
            .expect("response for id 5");
        assert_eq!(failed["error"]["code"], -32603);
        assert_eq!(failed["error"]["data"]["code"], "internal");
        assert!(responses.iter().any(|r| r["id"] == 6 && r["result"].is_object()));
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let responses = run("\n   \n\t\n").await;
        assert!(responses.is_empty());
    }

    #[tokio::test]
    async fn every_request_gets_one_response() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n",
            "garbage\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"test_connection\",\"arguments\":{\"account_id\":\"acct1\"}}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"nope\"}\n",
        );
        let responses = run(input).await;
        assert_eq!(responses.len(), 4);

        let by_id = |id: Value| {
            responses
                .iter()
                .find(|r| r["id"] == id)
                .cloned()
                .expect("response for id")
        };
        assert!(by_id(json!(1))["result"]["protocolVersion"].is_string());
        assert_eq!(by_id(json!(2))["result"]["structuredContent"]["data"]["success"], true);
        assert_eq!(by_id(json!(3))["error"]["code"], -32601);
        assert_eq!(by_id(Value::Null)["error"]["code"], -32700);
    }
}
