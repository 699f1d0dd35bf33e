//! MCP (Model Context Protocol) Server Implementation
//!
//! This module exposes the Azure CLI service as an MCP server, built directly
//! on Tokio and Serde (no external SDK).
//!
//! # Architecture
//!
//! The implementation is organized into three layers:
//!
//! 1. **Protocol Layer** (`protocol`): JSON-RPC 2.0 message types
//! 2. **Transport Layer** (`transport`): newline-delimited framing
//! 3. **Server Layer** (`server`): dispatch and the `execute_azure_cli_command` tool

// Protocol layer: JSON-RPC 2.0 message types
pub mod protocol;

// Transport layer: line framing over any byte stream
pub mod transport;

// Server layer: request dispatch
pub mod server;

pub use protocol::{
    ClientInfo, Content, InitializeParams, InitializeResult, McpError, McpMethod, McpRequest,
    McpResponse, ServerInfo, Tool, ToolCallParams, ToolCallResult,
};
pub use server::{azure_cli_tool, McpServer, SERVER_NAME, TOOL_NAME};
pub use transport::{LineReader, LineWriter};
