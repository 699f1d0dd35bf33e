//! Azure CLI MCP Server Library
//!
//! This library provides the core functionality of the Azure CLI MCP server:
//! command validation, process execution, the device-code login session, and
//! the MCP server that exposes them as a single tool.

pub mod config;
pub mod logging;
pub mod mcp;
pub mod metrics;
pub mod metrics_server;
pub mod service;
pub mod tools;
