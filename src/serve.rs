//! JSON-RPC over newline-delimited stdio.
//!
//! One request per line in, one response per line out. Requests run
//! concurrently, so responses may come back out of order; callers match them
//! by `id`. Logs must go to stderr while serving, since stdout is the
//! protocol channel. The loop ends when input closes or a shutdown token is
//! cancelled.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use sandbox_runtime::{ExecutionRequest, SandboxOrchestrator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use threat_scanner::ThreatScanner;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

#[derive(Serialize, Deserialize, Debug)]
pub struct JsonRpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

impl JsonRpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

/// Everything a request handler can reach.
pub struct ServeContext {
    pub sandbox: Arc<SandboxOrchestrator>,
    pub scanner: ThreatScanner,
}

impl ServeContext {
    pub fn new(sandbox: Arc<SandboxOrchestrator>) -> Self {
        let scanner = ThreatScanner::new(sandbox.config().scanner_config());
        Self { sandbox, scanner }
    }
}

/// Handles one protocol line. Blank lines produce no response.
pub async fn handle_line(ctx: &ServeContext, line: &str) -> Option<JsonRpcResponse> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Failed to parse request: {}", e);
            return Some(JsonRpcResponse::err(None, PARSE_ERROR, "Parse error"));
        }
    };
    debug!(method = %request.method, "request received");
    Some(handle_request(ctx, request).await)
}

async fn handle_request(ctx: &ServeContext, req: JsonRpcRequest) -> JsonRpcResponse {
    let id = req.id.clone();
    let result = match req.method.as_str() {
        "execute" => handle_execute(ctx, req.params).await,
        "scan" => handle_scan(ctx, req.params.as_ref()),
        "health" => Ok(json!({ "components": ctx.sandbox.health() })),
        "active" => Ok(json!({ "executions": ctx.sandbox.registry().snapshot() })),
        "emergency_stop" => {
            let reason = req
                .params
                .as_ref()
                .and_then(|p| p["reason"].as_str())
                .unwrap_or("requested over protocol")
                .to_string();
            Ok(json!({ "cancelled": ctx.sandbox.emergency_stop(reason) }))
        }
        "clear_emergency_stop" => {
            ctx.sandbox.clear_emergency_stop();
            Ok(json!({ "cleared": true }))
        }
        other => {
            return JsonRpcResponse::err(id, METHOD_NOT_FOUND, format!("Method not found: {other}"))
        }
    };

    match result {
        Ok(value) => JsonRpcResponse::ok(id, value),
        Err(e) => JsonRpcResponse::err(id, INVALID_PARAMS, e.to_string()),
    }
}

async fn handle_execute(ctx: &ServeContext, params: Option<Value>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow!("Missing params"))?;
    let request: ExecutionRequest =
        serde_json::from_value(params).map_err(|e| anyhow!("Invalid execution request: {e}"))?;
    let result = ctx.sandbox.run(request).await;
    Ok(serde_json::to_value(result)?)
}

fn handle_scan(ctx: &ServeContext, params: Option<&Value>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow!("Missing params"))?;
    let code = params["code"]
        .as_str()
        .ok_or_else(|| anyhow!("Missing code"))?;
    let filename = params["filename"].as_str().unwrap_or("<inline>");
    Ok(ctx.scanner.analyze(code, filename).to_json())
}

/// Reads requests from `reader` until EOF, answering on `writer`. In-flight
/// requests are drained before returning.
pub async fn serve<R, W>(ctx: Arc<ServeContext>, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    serve_until(ctx, reader, writer, CancellationToken::new()).await
}

/// [`serve`], but also stops reading once `shutdown` is cancelled.
pub async fn serve_until<R, W>(
    ctx: Arc<ServeContext>,
    reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut in_flight = JoinSet::new();
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("🛑 Shutdown requested, no longer reading input");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("📭 Input closed");
            break;
        };
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(response) = handle_line(&ctx, &line).await {
                match serde_json::to_string(&response) {
                    Ok(encoded) => {
                        if tx.send(encoded).await.is_err() {
                            warn!("Response writer closed; dropping response");
                        }
                    }
                    Err(e) => error!("Failed to encode response: {}", e),
                }
            }
        });
    }
    info!("Draining {} request(s)", in_flight.len());

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("💥 Request handler panicked: {}", e);
        }
    }
    drop(tx);
    writer_task.await??;
    Ok(())
}
