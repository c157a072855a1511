//! A tool provider served by a [`Reactor`](crate::Reactor).

use std::sync::Arc;

use mcp::{
    CallToolParams, CallToolResult, InitializeResult, JsonRpcError, ListToolsResult,
    PROTOCOL_VERSION, ServerCapabilities, ServerInfo, ToolSchema, ToolsCapability,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::registry::{MethodRegistry, ParamSpec};

type ToolFn = Arc<dyn Fn(Map<String, Value>) -> Result<String, HandlerError> + Send + Sync>;

struct RegisteredTool {
    schema: ToolSchema,
    call: ToolFn,
}

/// Exposes a set of tools over the MCP methods (`initialize`, `tools/list`,
/// `tools/call`, ...).
pub struct ToolProvider {
    info: ServerInfo,
    instructions: Option<String>,
    tools: Vec<RegisteredTool>,
}

impl ToolProvider {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: ServerInfo {
                name: name.into(),
                version: Some(version.into()),
            },
            instructions: None,
            tools: Vec::new(),
        }
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Add a tool taking its arguments as a JSON object.
    ///
    /// Arguments are coerced to the schema's types before the call.
    pub fn tool<F>(mut self, schema: ToolSchema, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Result<String, HandlerError> + Send + Sync + 'static,
    {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.schema.name == schema.name) {
            existing.schema = schema;
            existing.call = Arc::new(f);
        } else {
            self.tools.push(RegisteredTool {
                schema,
                call: Arc::new(f),
            });
        }
        self
    }

    /// Add a tool whose arguments deserialize into `T`.
    pub fn typed_tool<T, F>(self, schema: ToolSchema, f: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> Result<String, HandlerError> + Send + Sync + 'static,
    {
        self.tool(schema, move |arguments| {
            let input = serde_json::from_value(Value::Object(arguments))
                .map_err(|e| HandlerError::failed(format!("invalid arguments: {e}")))?;
            f(input)
        })
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    /// Register the MCP methods on `registry`.
    pub fn register(self, registry: &MethodRegistry) {
        let provider = Arc::new(self);
        info!(
            provider = %provider.info.name,
            tools = provider.tools.len(),
            "registering tool provider"
        );

        let this = provider.clone();
        registry.register_async("initialize", ParamSpec::Open, move |params| {
            let this = this.clone();
            async move { this.initialize(params) }
        });

        registry.register_async("notifications/initialized", ParamSpec::Open, |_| async {
            debug!("client initialized");
            Ok::<_, HandlerError>(Value::Null)
        });

        registry.register_async("ping", ParamSpec::Open, |_| async {
            Ok::<_, HandlerError>(json!({}))
        });

        let this = provider.clone();
        registry.register_async("tools/list", ParamSpec::fixed(["cursor"]), move |_| {
            let this = this.clone();
            async move { this.list_tools() }
        });

        let this = provider;
        registry.register_blocking(
            "tools/call",
            ParamSpec::fixed(["name", "arguments"]),
            move |params| this.call_tool(params),
        );
    }

    fn initialize(&self, params: Value) -> Result<Value, HandlerError> {
        let client = params
            .pointer("/clientInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(%client, "initialize");

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                ..ServerCapabilities::default()
            },
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn list_tools(&self) -> Result<Value, HandlerError> {
        let result = ListToolsResult {
            tools: self.tools.iter().map(|t| t.schema.to_tool()).collect(),
            next_cursor: None,
        };
        Ok(serde_json::to_value(result)?)
    }

    fn call_tool(&self, params: Value) -> Result<Value, HandlerError> {
        let params: CallToolParams =
            serde_json::from_value(params).map_err(JsonRpcError::invalid_params)?;

        let result = match self.tools.iter().find(|t| t.schema.name == params.name) {
            None => CallToolResult::error(format!("Unknown tool: {}", params.name)),
            Some(tool) => {
                let arguments = tool
                    .schema
                    .coerce_arguments(params.arguments.unwrap_or_default());
                debug!(tool = %params.name, "calling tool");
                match (tool.call)(arguments) {
                    Ok(text) => CallToolResult::text(text),
                    Err(e) => CallToolResult::error(e.to_string()),
                }
            }
        };
        Ok(serde_json::to_value(result)?)
    }
}
