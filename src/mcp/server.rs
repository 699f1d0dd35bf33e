//! MCP Server
//!
//! Serves the single `execute_azure_cli_command` tool over newline-delimited
//! JSON-RPC. Every request runs in its own task so a slow command never blocks
//! `ping` or a second call; responses go through one writer task so lines
//! never interleave.

use crate::mcp::protocol::{
    InitializeParams, InitializeResult, McpError, McpMethod, McpRequest, McpResponse, ServerInfo,
    Tool, ToolCallParams, ToolCallResult, DEFAULT_PROTOCOL_VERSION, JSONRPC_VERSION,
};
use crate::mcp::transport::{LineReader, LineWriter};
use crate::service::{is_error_text, AzureCliService};
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Name of the only tool
pub const TOOL_NAME: &str = "execute_azure_cli_command";

/// Name reported in `serverInfo`
pub const SERVER_NAME: &str = "azure-cli-mcp";

/// Definition returned by `tools/list`
pub fn azure_cli_tool() -> Tool {
    Tool {
        name: TOOL_NAME.to_string(),
        description: "Execute Azure CLI commands. Run any Azure CLI command and get its output. \
            Commands must start with 'az'. For authentication, use 'az login' for the device \
            code flow or configure service principal credentials in environment variables."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The Azure CLI command to execute. Must start with 'az'. \
                        Examples: 'az account list', 'az login', 'az group list'"
                }
            },
            "required": ["command"]
        }),
    }
}

pub struct McpServer {
    service: Arc<AzureCliService>,
}

impl McpServer {
    pub fn new(service: Arc<AzureCliService>) -> Self {
        Self { service }
    }

    /// Serve on the process's stdin/stdout until stdin closes
    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one client until its input ends
    ///
    /// Requests still running at end of input are completed and answered
    /// before this returns.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<McpResponse>(64);
        let writer_task = tokio::spawn(async move {
            let mut writer = LineWriter::new(writer);
            while let Some(response) = rx.recv().await {
                if let Err(e) = writer.send(&response).await {
                    error!("Failed to write response: {:#}", e);
                    break;
                }
            }
        });

        info!("MCP server ready, tool: {}", TOOL_NAME);
        let mut reader = LineReader::new(reader);
        let mut in_flight = JoinSet::new();

        loop {
            let line = match reader.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopping on input error: {:#}", e);
                    break;
                }
            };

            let server = self.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                if let Some(response) = server.handle_line(&line).await {
                    if tx.send(response).await.is_err() {
                        debug!("Writer closed, dropping response");
                    }
                }
            });

            // Reap finished handlers so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        }

        info!("Client input closed, finishing {} in-flight request(s)", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Request handler panicked: {}", e);
            }
        }
        drop(tx);

        if let Err(e) = writer_task.await {
            error!("Writer task failed: {}", e);
        }
        Ok(())
    }

    /// Parse and dispatch one line; `None` for notifications
    pub async fn handle_line(&self, line: &str) -> Option<McpResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Unparsable message: {}", e);
                return Some(McpResponse::err(
                    Value::Null,
                    McpError::parse_error(format!("Parse error: {}", e)),
                ));
            }
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: McpRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return Some(McpResponse::err(
                    id,
                    McpError::invalid_request(format!("Invalid request: {}", e)),
                ))
            }
        };

        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        let Some(id) = request.id.clone() else {
            debug!(method = %request.method, "Notification received");
            return None;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(McpResponse::err(
                id,
                McpError::invalid_request(format!("Unsupported jsonrpc version: {}", request.jsonrpc)),
            ));
        }

        debug!(method = %request.method, id = %id, "Request received");
        let result = match McpMethod::from(request.method.as_str()) {
            McpMethod::Initialize => self.initialize(request.params),
            McpMethod::Ping => Ok(json!({})),
            McpMethod::ToolsList => Ok(json!({ "tools": [azure_cli_tool()] })),
            McpMethod::ToolsCall => self.call_tool(request.params).await,
            McpMethod::Custom(method) => Err(McpError::method_not_found(method)),
        };

        Some(match result {
            Ok(result) => McpResponse::ok(id, result),
            Err(error) => McpResponse::err(id, error),
        })
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, McpError> {
        let params: InitializeParams = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| McpError::invalid_params(format!("Invalid initialize params: {}", e)))?,
            None => InitializeParams::default(),
        };

        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = %client.version, "Client connected");
        }

        let result = InitializeResult {
            protocol_version: params
                .protocol_version
                .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
            capabilities: json!({ "tools": { "listChanged": false } }),
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        serde_json::to_value(result).map_err(|e| McpError::internal_error(e.to_string()))
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, McpError> {
        let params: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| McpError::invalid_params(format!("Invalid tool call params: {}", e)))?;

        let result = if params.name != TOOL_NAME {
            warn!(tool = %params.name, "Unknown tool requested");
            ToolCallResult::text(format!("Unknown tool: {}", params.name), true)
        } else {
            let text = match params.arguments.as_ref().and_then(|args| args.get("command")) {
                None => "Error: Missing command argument".to_string(),
                Some(Value::String(command)) => {
                    let call_id = Uuid::new_v4();
                    let span = info_span!("tool_call", call_id = %call_id);
                    async {
                        info!(command = %command, "Executing Azure CLI command via MCP");
                        self.service.execute(command).await
                    }
                    .instrument(span)
                    .await
                }
                Some(_) => "Error: Command must be a string".to_string(),
            };
            let is_error = is_error_text(&text);
            ToolCallResult::text(text, is_error)
        };

        serde_json::to_value(result).map_err(|e| McpError::internal_error(e.to_string()))
    }
}
