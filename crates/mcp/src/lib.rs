//! MCP (Model Context Protocol) client library.
//!
//! This crate launches tool providers as child processes, speaks
//! newline-delimited JSON-RPC 2.0 with them over stdio, discovers their tools
//! and invokes them.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{Hub, HubConfig};
//! use serde_json::json;
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = HubConfig::load("mcp.json")?;
//!
//! let mut hub = Hub::new();
//! let report = hub.load(&config).await;
//! for (name, error) in &report.failed {
//!     eprintln!("{name}: {error}");
//! }
//!
//! for declaration in hub.function_declarations() {
//!     println!("{}", declaration["function"]["name"]);
//! }
//!
//! let args = json!({"location": "beijing"});
//! let text = hub
//!     .call_function("weather__get_weather", args.as_object().cloned().unwrap_or_default())
//!     .await?;
//! println!("{text}");
//!
//! hub.dispose_all().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod framing;
mod hub;
mod protocol;
mod schema;
mod transport;

pub use client::{
    Client, ClientOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, RootsResponder, Status,
};
pub use config::{HubConfig, ProviderConfig};
pub use error::{Error, Result};
pub use framing::{Frame, read_frame};
pub use hub::{Hub, LoadReport};
pub use protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListRootsResult, ListToolsParams, ListToolsResult, Message, Outcome,
    PROTOCOL_VERSION, PromptsCapability, RequestId, ResourcesCapability, Root, RootsCapability,
    ServerCapabilities, ServerInfo, Tool, ToolContent, ToolsCapability, error_codes,
};
pub use schema::{
    JsonType, NAME_SEPARATOR, ParamType, ToolParameter, ToolSchema, ToolSchemaBuilder,
    function_name, provider_prefix,
};
pub use transport::{
    MAX_LINE_BYTES, PeerRequestHandler, PendingCall, StdioTransport, TransportOptions,
};
