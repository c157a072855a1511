//! Protocol client for a single provider connection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ListRootsResult, ListToolsResult, Root,
};
use crate::schema::ToolSchema;
use crate::transport::{PeerRequestHandler, StdioTransport, TransportOptions};

/// Default deadline for the initialize handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for other requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client timing options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub transport: TransportOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            transport: TransportOptions::default(),
        }
    }
}

impl ClientOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Connection lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Connecting,
            1 => Status::Connected,
            _ => Status::Disconnected,
        }
    }
}

/// A connection to one provider process.
pub struct Client {
    transport: StdioTransport,
    options: ClientOptions,
    status: AtomicU8,
    server_info: OnceLock<InitializeResult>,
    tools: RwLock<Vec<ToolSchema>>,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        let roots = Arc::new(RootsResponder::from_args(&args));
        let transport = StdioTransport::new(name, command, args, env).with_peer_handler(roots);
        Self {
            transport,
            options: ClientOptions::default(),
            status: AtomicU8::new(Status::Connecting as u8),
            server_info: OnceLock::new(),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.transport = self.transport.with_options(options.transport.clone());
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn advance(&self, status: Status) {
        self.status.fetch_max(status as u8, Ordering::SeqCst);
    }

    /// Result of the initialize handshake, once connected.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    /// Tools discovered by the last [`Client::list_tools`].
    pub fn tools(&self) -> Vec<ToolSchema> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn tool(&self, name: &str) -> Option<ToolSchema> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name == name)
            .cloned()
    }

    /// Start the provider, perform the handshake and discover its tools.
    pub async fn connect(&self) -> Result<()> {
        if self.status() == Status::Disconnected {
            return Err(Error::NotConnected);
        }
        self.transport.start().await?;

        let result = self.initialize().await.map_err(|e| Error::Handshake {
            name: self.name().to_string(),
            reason: e.to_string(),
        })?;
        info!(
            provider = %self.name(),
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "handshake complete"
        );
        // Already set only if connect() is repeated; the first result wins.
        let _ = self.server_info.set(result);

        self.transport.notify("notifications/initialized", None).await?;
        self.advance(Status::Connected);

        self.list_tools().await?;
        Ok(())
    }

    async fn initialize(&self) -> Result<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let response = self
            .transport
            .request("initialize", Some(params))
            .await?
            .wait(self.options.connect_timeout())
            .await?;
        let value = response.into_result()?;
        serde_json::from_value(value).map_err(|e| Error::InvalidResponse(e.to_string()))
    }

    /// Fetch the provider's tools and replace the cached set.
    ///
    /// Only the first page is read; a `nextCursor` is logged and ignored.
    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>> {
        let discovery = |reason: String| Error::Discovery {
            name: self.name().to_string(),
            reason,
        };

        let value = match self.request("tools/list", None, self.options.request_timeout()).await {
            Ok(value) => value,
            Err(e) if e.is_timeout() => return Err(e),
            Err(e) => return Err(discovery(e.to_string())),
        };
        let result: ListToolsResult =
            serde_json::from_value(value).map_err(|e| discovery(e.to_string()))?;

        if let Some(cursor) = &result.next_cursor {
            debug!(provider = %self.name(), %cursor, "tools/list has more pages; not fetched");
        }

        let schemas: Vec<ToolSchema> = result.tools.iter().map(ToolSchema::from_tool).collect();
        info!(provider = %self.name(), count = schemas.len(), "discovered tools");
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = schemas.clone();
        Ok(schemas)
    }

    /// Call a tool with the default request timeout.
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<String> {
        self.call_tool_with_timeout(name, arguments, self.options.request_timeout())
            .await
    }

    /// Call a tool and return its text content joined by newlines.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        deadline: Duration,
    ) -> Result<String> {
        if self.status() != Status::Connected {
            return Err(Error::NotConnected);
        }

        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let value = match self
            .request("tools/call", Some(serde_json::to_value(params)?), deadline)
            .await
        {
            Ok(value) => value,
            Err(Error::JsonRpc(e)) => return Err(Error::ToolCall(e.message)),
            Err(e) => return Err(e),
        };

        let result: CallToolResult =
            serde_json::from_value(value).map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let text = result.joined_text();
        if result.is_error {
            return Err(Error::ToolCall(text));
        }
        Ok(text)
    }

    /// Liveness check; the provider answers with an empty result.
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None, self.options.request_timeout())
            .await
            .map(|_| ())
    }

    /// Mark the connection disconnected and shut the provider down.
    pub async fn close(&self) {
        self.advance(Status::Disconnected);
        self.transport.close().await;
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let response = self.transport.request(method, params).await?.wait(deadline).await?;
        Ok(response.into_result()?)
    }
}

/// Answers `roots/list` with the directories and files named in the
/// provider's launch arguments.
#[derive(Debug, Clone, Default)]
pub struct RootsResponder {
    roots: Vec<Root>,
}

impl RootsResponder {
    /// Collect roots from arguments that look like paths and exist on disk.
    pub fn from_args(args: &[String]) -> Self {
        let roots = args
            .iter()
            .filter(|arg| looks_like_path(arg))
            .map(Path::new)
            .filter(|path| path.exists())
            .map(|path| {
                let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
                Root {
                    uri: file_uri(&path),
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .or_else(|| Some(path.to_string_lossy().into_owned())),
                }
            })
            .collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[Root] {
        &self.roots
    }
}

impl PeerRequestHandler for RootsResponder {
    fn handle(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.method != "roots/list" {
            return None;
        }
        let result = ListRootsResult {
            roots: self.roots.clone(),
        };
        let value = serde_json::to_value(result).ok()?;
        Some(JsonRpcResponse::success(request.id.clone(), value))
    }
}

fn looks_like_path(arg: &str) -> bool {
    if arg.starts_with('-') {
        return false;
    }
    let bytes = arg.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    arg.contains('/') || arg.contains('\\') || drive
}

fn file_uri(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{path}")
    } else {
        format!("file:///{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    #[test]
    fn path_detection() {
        assert!(looks_like_path("/tmp"));
        assert!(looks_like_path("./data"));
        assert!(looks_like_path("C:"));
        assert!(looks_like_path("dir\\file"));
        assert!(!looks_like_path("--root=/tmp"));
        assert!(!looks_like_path("serve"));
    }

    #[test]
    fn roots_from_existing_paths_only() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().to_string_lossy().into_owned();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();

        let responder = RootsResponder::from_args(&[
            "serve".to_string(),
            "--verbose".to_string(),
            existing,
            missing,
        ]);

        assert_eq!(responder.roots().len(), 1);
        let root = &responder.roots()[0];
        assert!(root.uri.starts_with("file://"));
        assert_eq!(
            root.name.as_deref(),
            dir.path().canonicalize().unwrap().file_name().and_then(|n| n.to_str())
        );
    }

    #[test]
    fn responder_only_answers_roots_list() {
        let responder = RootsResponder::default();

        let other = JsonRpcRequest::new("x", "sampling/createMessage");
        assert!(responder.handle(&other).is_none());

        let roots = JsonRpcRequest::new(RequestId::Number(4), "roots/list");
        let answer = responder.handle(&roots).unwrap();
        assert_eq!(answer.id, Some(RequestId::Number(4)));
        assert_eq!(answer.into_result().unwrap(), serde_json::json!({"roots": []}));
    }

    #[test]
    fn status_only_moves_forward() {
        let client = Client::new("idle", "true", vec![], HashMap::new());
        assert_eq!(client.status(), Status::Connecting);
        client.advance(Status::Disconnected);
        client.advance(Status::Connected);
        assert_eq!(client.status(), Status::Disconnected);
    }

    #[cfg(unix)]
    fn scripted(script: &str) -> Client {
        Client::new(
            "scripted",
            "sh",
            vec!["-c".to_string(), script.to_string()],
            HashMap::new(),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_discovery_and_calls() {
        let client = scripted(r#"read init
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"scripted"}}}'
read initialized
read list
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}],"nextCursor":"more"}}'
read call
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"a"},{"type":"image","data":"","mimeType":"image/png"},{"type":"text","text":"b"}],"isError":false}}'
read call
echo '{"jsonrpc":"2.0","id":4,"result":{"content":[{"type":"text","text":"bad input"}],"isError":true}}'
read call
echo '{"jsonrpc":"2.0","id":5,"error":{"code":-32602,"message":"unknown tool"}}'
cat > /dev/null"#);

        client.connect().await.unwrap();
        assert_eq!(client.status(), Status::Connected);
        assert_eq!(client.server_info().unwrap().server_info.name, "scripted");

        let tools = client.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].required_names(), vec!["text"]);

        let text = client.call_tool("echo", Map::new()).await.unwrap();
        assert_eq!(text, "a\nb");

        let err = client.call_tool("echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::ToolCall(ref msg) if msg == "bad input"));

        let err = client.call_tool("nope", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::ToolCall(ref msg) if msg == "unknown tool"));

        client.close().await;
        assert_eq!(client.status(), Status::Disconnected);
        assert!(matches!(
            client.call_tool("echo", Map::new()).await,
            Err(Error::NotConnected)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_error_result() {
        let client = scripted(r#"read init
echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32603,"message":"boom"}}'
cat > /dev/null"#);

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Handshake { ref reason, .. } if reason.contains("boom")));
        client.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handshake_deadline() {
        let client = scripted("cat > /dev/null").with_options(ClientOptions {
            connect_timeout_ms: 100,
            ..ClientOptions::default()
        });

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
        assert_eq!(client.status(), Status::Connecting);
        client.close().await;
    }
}
