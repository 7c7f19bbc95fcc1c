//! JSON-RPC 2.0 dispatch
//!
//! Methods: `initialize`, `tools/list` (cursor pagination), `tools/call`.
//! Calls execute concurrently up to the configured bound; additional calls
//! queue on the semaphore. Every call carries a deadline; expiry cancels the
//! handler (the future is dropped) and returns `-32000 Timeout`. Exactly one
//! response is emitted per request id.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

use sona_config::ToolOptions;
use sona_core::ToolError;

use crate::registry::ToolRegistry;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const CODE_SERVER_ERROR: i64 = -32000;
const CODE_METHOD_NOT_FOUND: i64 = -32601;
const CODE_INVALID_PARAMS: i64 = -32602;

/// Routes JSON-RPC requests from the peer to registered tools.
pub struct McpDispatcher {
    registry: Arc<ToolRegistry>,
    options: ToolOptions,
    permits: Arc<Semaphore>,
    out_tx: mpsc::Sender<Value>,
}

impl McpDispatcher {
    /// Seal the registry and start serving it.
    ///
    /// Responses are emitted on `out_tx`; the session wraps them in the
    /// `mcp` transport envelope.
    pub fn new(registry: Arc<ToolRegistry>, options: ToolOptions, out_tx: mpsc::Sender<Value>) -> Self {
        registry.seal();
        let permits = Arc::new(Semaphore::new(options.max_concurrent));
        Self {
            registry,
            options,
            permits,
            out_tx,
        }
    }

    /// Handle one inbound JSON-RPC message.
    ///
    /// Notifications are ignored; requests without an id cannot be answered
    /// and are logged and dropped.
    pub async fn handle(&self, payload: Value) {
        if payload.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            tracing::warn!("non-2.0 jsonrpc payload dropped");
            return;
        }

        let Some(method) = payload.get("method").and_then(Value::as_str) else {
            tracing::warn!("jsonrpc payload without method dropped");
            return;
        };

        if method.starts_with("notifications") {
            tracing::debug!(method, "notification ignored");
            return;
        }

        let Some(id) = payload.get("id").cloned().filter(|id| !id.is_null()) else {
            tracing::warn!(method, "request without id dropped");
            return;
        };

        let params = payload.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                self.reply_result(
                    id,
                    json!({
                        "protocolVersion": MCP_PROTOCOL_VERSION,
                        "capabilities": { "tools": {} },
                        "serverInfo": {
                            "name": env!("CARGO_PKG_NAME"),
                            "version": env!("CARGO_PKG_VERSION"),
                        },
                    }),
                )
                .await;
            }
            "tools/list" => {
                let cursor = params.get("cursor").and_then(Value::as_str);
                let (tools, next) = self.registry.page(cursor, self.options.list_page_size);
                let mut result = json!({ "tools": tools });
                if let Some(next) = next {
                    result["nextCursor"] = Value::String(next);
                }
                self.reply_result(id, result).await;
            }
            "tools/call" => {
                self.dispatch_call(id, params).await;
            }
            other => {
                self.reply_error(id, CODE_METHOD_NOT_FOUND, &format!("Method not found: {other}"))
                    .await;
            }
        }
    }

    /// Validate, queue and run one tool call on its own task.
    async fn dispatch_call(&self, id: Value, params: Value) {
        let Some(name) = params.get("name").and_then(Value::as_str).map(str::to_string) else {
            self.reply_error(id, CODE_INVALID_PARAMS, "Invalid params: missing tool name")
                .await;
            return;
        };

        let Some(tool) = self.registry.get(&name) else {
            self.reply_error(id, CODE_METHOD_NOT_FOUND, &format!("Method not found: {name}"))
                .await;
            return;
        };

        // Validate before queueing so malformed calls fail fast.
        let arguments = match tool.properties().parse_arguments(params.get("arguments")) {
            Ok(arguments) => arguments,
            Err(e) => {
                self.reply_error(id, CODE_INVALID_PARAMS, &format!("Invalid params: {e}"))
                    .await;
                return;
            }
        };

        let permits = self.permits.clone();
        let out_tx = self.out_tx.clone();
        let deadline = Duration::from_secs(self.options.call_timeout_secs);
        let timeout_secs = self.options.call_timeout_secs;

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // dispatcher shut down
            };

            let started = std::time::Instant::now();
            let response = match tokio::time::timeout(deadline, tool.execute(arguments)).await {
                Ok(Ok(output)) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "result": output.to_json(),
                }),
                Ok(Err(e)) => {
                    tracing::warn!(tool = %name, error = %e, "tool call failed");
                    error_response(id, CODE_SERVER_ERROR, &redact(&e))
                }
                Err(_) => {
                    tracing::warn!(tool = %name, timeout_secs, "tool call timed out");
                    error_response(
                        id,
                        CODE_SERVER_ERROR,
                        &format!("Timeout after {timeout_secs}s"),
                    )
                }
            };

            tracing::debug!(
                tool = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "tool call finished"
            );
            let _ = out_tx.send(response).await;
        });
    }

    async fn reply_result(&self, id: Value, result: Value) {
        let _ = self
            .out_tx
            .send(json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }))
            .await;
    }

    async fn reply_error(&self, id: Value, code: i64, message: &str) {
        let _ = self.out_tx.send(error_response(id, code, message)).await;
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// Handler failures cross the wire with internals stripped.
fn redact(error: &ToolError) -> String {
    match error {
        ToolError::Timeout(secs) => format!("Timeout after {secs}s"),
        _ => "Server error".to_string(),
    }
}
