//! Host-side dispatch of inbound JSON-RPC messages.

use std::sync::Arc;

use mcp::{Frame, JSONRPC_VERSION, JsonRpcError, JsonRpcResponse, RequestId, read_frame};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::config::ReactorConfig;
use crate::error::{Error, Result};
use crate::handler::{Executor, Handler, Incoming, MethodCallHandler, NotificationHandler};
use crate::registry::MethodRegistry;
use crate::supervisor::{ReactorState, Supervisor};

/// Classifies inbound lines, routes them through the handler chain and
/// writes the responses.
pub struct Reactor {
    registry: Arc<MethodRegistry>,
    executor: Arc<Executor>,
    handlers: Vec<Arc<dyn Handler>>,
    supervisor: Supervisor,
    config: ReactorConfig,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(ReactorConfig::default())
    }
}

impl Reactor {
    /// A reactor with the method-call and notification handlers installed.
    pub fn new(config: ReactorConfig) -> Self {
        let registry = Arc::new(MethodRegistry::new());
        let executor = Arc::new(Executor::new(
            registry.clone(),
            config.max_workers,
            config.request_timeout(),
        ));
        let handlers: Vec<Arc<dyn Handler>> = vec![
            Arc::new(MethodCallHandler::new(executor.clone())),
            Arc::new(NotificationHandler::new(executor.clone())),
        ];

        Self {
            registry,
            executor,
            handlers,
            supervisor: Supervisor::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    /// Put a handler ahead of the built-in ones.
    pub fn add_handler(&mut self, handler: Arc<dyn Handler>) {
        let builtin = self.handlers.len().saturating_sub(2);
        self.handlers.insert(builtin, handler);
    }

    /// Handle one raw line. Returns the response to write, if any.
    pub async fn dispatch(&self, raw: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "unparseable input");
                return Some(JsonRpcResponse::failure(None, JsonRpcError::parse_error()));
            }
        };

        let Value::Object(map) = value else {
            return Some(JsonRpcResponse::failure(None, JsonRpcError::invalid_request()));
        };

        let id = match map.get("id") {
            None | Some(Value::Null) => None,
            Some(raw_id) => match serde_json::from_value::<RequestId>(raw_id.clone()) {
                Ok(id) => Some(id),
                Err(_) => {
                    return Some(JsonRpcResponse::failure(None, JsonRpcError::invalid_request()));
                }
            },
        };
        let invalid = |id: Option<RequestId>| {
            Some(JsonRpcResponse::failure(id, JsonRpcError::invalid_request()))
        };

        if map.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            debug!(id = ?id, version = ?map.get("jsonrpc"), "unsupported JSON-RPC version");
            return invalid(id);
        }

        let method = match map.get("method") {
            Some(Value::String(method)) => method.clone(),
            None if map.contains_key("result") || map.contains_key("error") => {
                debug!(id = ?id, "dropping response sent to the reactor");
                return None;
            }
            _ => return invalid(id),
        };

        let params = match map.get("params") {
            None | Some(Value::Null) => None,
            Some(params @ Value::Object(_)) => Some(params.clone()),
            Some(_) => return invalid(id),
        };

        let message = Incoming { id, method, params };
        trace!(method = %message.method, id = ?message.id, "dispatch");

        match self.handlers.iter().find(|h| h.accepts(&message)) {
            Some(handler) => handler.handle(message).await,
            None => message
                .id
                .map(|id| JsonRpcResponse::failure(Some(id), JsonRpcError::method_not_found())),
        }
    }

    /// Read lines from `reader` until EOF or shutdown, answering on `writer`.
    ///
    /// Each line is dispatched as its own task; a single writer task owns
    /// `writer`. On exit, in-flight calls are allowed to finish (each bounded
    /// by the request timeout) before the reactor reports `Stopped`.
    /// A reactor serves once; later calls fail with [`Error::AlreadyServed`].
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if !self.supervisor.begin() {
            return Err(Error::AlreadyServed);
        }
        info!(
            max_workers = self.config.max_workers,
            timeout_ms = self.config.request_timeout_ms,
            "reactor running"
        );

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let tracker = TaskTracker::new();
        let mut reader = BufReader::new(reader);
        let max_line_bytes = self.config.max_line_bytes;
        let parse_error = JsonRpcResponse::failure(None, JsonRpcError::parse_error());
        let mut read_error = None;

        loop {
            let frame = tokio::select! {
                _ = self.supervisor.cancelled() => break,
                frame = read_frame(&mut reader, max_line_bytes) => frame,
            };

            let line = match frame {
                Ok(Frame::Line(line)) => line,
                Ok(Frame::Eof) => {
                    debug!("input closed");
                    break;
                }
                Ok(Frame::Oversized(len)) => {
                    warn!(len, max = max_line_bytes, "rejecting oversized line");
                    send_response(&tx, &parse_error);
                    continue;
                }
                Ok(Frame::InvalidUtf8) => {
                    debug!("rejecting line that is not valid UTF-8");
                    send_response(&tx, &parse_error);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read input");
                    read_error = Some(e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let reactor = self.clone();
            let tx = tx.clone();
            tracker.spawn(async move {
                if let Some(response) = reactor.dispatch(&line).await {
                    send_response(&tx, &response);
                }
            });
        }

        self.supervisor.set_state(ReactorState::Draining);
        tracker.close();
        tracker.wait().await;
        drop(tx);

        let written = writer_task.await;
        self.supervisor.set_state(ReactorState::Stopped);

        if let Some(e) = read_error {
            return Err(e.into());
        }
        match written {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(Error::Writer(e.to_string())),
        }
    }

    /// [`Reactor::serve`] over the process's stdin and stdout.
    pub async fn serve_stdio(self: &Arc<Self>) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

fn send_response(tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(json) => {
            // Fails only once the writer has given up.
            let _ = tx.send(json);
        }
        Err(e) => warn!(error = %e, "failed to serialize response"),
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::registry::ParamSpec;
    use mcp::{Outcome, error_codes};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;

    fn reactor() -> Reactor {
        let reactor = Reactor::new(ReactorConfig {
            request_timeout_ms: 200,
            ..ReactorConfig::default()
        });
        let registry = reactor.registry();
        registry.register_blocking("echo", ParamSpec::Open, Ok);
        registry.register_blocking("greet", ParamSpec::fixed(["name"]), Ok);
        registry.register_blocking("fail", ParamSpec::Open, |_| Err(HandlerError::failed("boom")));
        registry.register_blocking("reject", ParamSpec::Open, |_| {
            Err(JsonRpcError::invalid_params("name is required").into())
        });
        registry.register_async("slow", ParamSpec::Open, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, HandlerError>(Value::Null)
        });
        reactor
    }

    fn error_code(response: JsonRpcResponse) -> i32 {
        match response.outcome {
            Outcome::Error(e) => e.code,
            Outcome::Result(value) => panic!("expected error, got {value}"),
        }
    }

    #[tokio::test]
    async fn answers_method_calls() {
        let response = reactor()
            .dispatch(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"x":1}}"#)
            .await
            .unwrap();
        assert_eq!(response.id, Some(RequestId::Number(1)));
        assert_eq!(response.into_result().unwrap(), json!({"x": 1}));
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_regardless_of_method() {
        let reactor = reactor();
        for method in ["echo", "missing"] {
            let raw = format!(r#"{{"jsonrpc":"1.0","id":"a","method":"{method}"}}"#);
            let response = reactor.dispatch(&raw).await.unwrap();
            assert_eq!(response.id, Some(RequestId::from("a")));
            assert_eq!(error_code(response), error_codes::INVALID_REQUEST);
        }

        let response = reactor.dispatch(r#"{"id":2,"method":"echo"}"#).await.unwrap();
        assert_eq!(error_code(response), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn malformed_input() {
        let reactor = reactor();

        let response = reactor.dispatch("{oops").await.unwrap();
        assert_eq!(response.id, None);
        assert_eq!(error_code(response), error_codes::PARSE_ERROR);

        let response = reactor.dispatch("[1, 2]").await.unwrap();
        assert_eq!(error_code(response), error_codes::INVALID_REQUEST);

        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":3,"method":7}"#)
            .await
            .unwrap();
        assert_eq!(response.id, Some(RequestId::Number(3)));
        assert_eq!(error_code(response), error_codes::INVALID_REQUEST);

        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":4,"method":"echo","params":"text"}"#)
            .await
            .unwrap();
        assert_eq!(error_code(response), error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn unknown_methods() {
        let reactor = reactor();
        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":5,"method":"missing"}"#)
            .await
            .unwrap();
        assert_eq!(error_code(response), error_codes::METHOD_NOT_FOUND);

        assert!(reactor.dispatch(r#"{"jsonrpc":"2.0","method":"missing"}"#).await.is_none());
        assert!(
            reactor
                .dispatch(r#"{"jsonrpc":"2.0","id":null,"method":"missing"}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn failures_are_contained() {
        let reactor = reactor();

        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":6,"method":"fail"}"#)
            .await
            .unwrap();
        let error = response.into_result().unwrap_err();
        assert_eq!(error.code, error_codes::INTERNAL_ERROR);
        assert_eq!(error.message, "Internal error: boom");

        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":7,"method":"reject"}"#)
            .await
            .unwrap();
        assert_eq!(error_code(response), error_codes::INVALID_PARAMS);

        assert!(reactor.dispatch(r#"{"jsonrpc":"2.0","method":"fail"}"#).await.is_none());

        // Still serving.
        assert!(reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":8,"method":"echo"}"#)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let reactor = reactor();
        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":9,"method":"slow"}"#)
            .await
            .unwrap();
        let error = response.into_result().unwrap_err();
        assert_eq!(error.code, -32000);
        assert_eq!(error.message, "Request timeout");

        assert!(reactor.dispatch(r#"{"jsonrpc":"2.0","method":"slow"}"#).await.is_none());
    }

    #[tokio::test]
    async fn fixed_params_are_filtered() {
        let response = reactor()
            .dispatch(r#"{"jsonrpc":"2.0","id":10,"method":"greet","params":{"name":"ada","admin":true}}"#)
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"name": "ada"}));
    }

    #[tokio::test]
    async fn responses_are_dropped() {
        let reactor = reactor();
        assert!(reactor.dispatch(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).await.is_none());
        assert!(reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":1,"error":{"code":1,"message":"x"}}"#)
            .await
            .is_none());
    }

    struct Intercept;

    #[async_trait::async_trait]
    impl Handler for Intercept {
        fn accepts(&self, message: &Incoming) -> bool {
            message.method.starts_with("custom/")
        }

        async fn handle(&self, message: Incoming) -> Option<JsonRpcResponse> {
            message.id.map(|id| JsonRpcResponse::success(id, json!("intercepted")))
        }
    }

    #[tokio::test]
    async fn custom_handlers_run_first() {
        let mut reactor = reactor();
        reactor.add_handler(Arc::new(Intercept));

        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":1,"method":"custom/thing"}"#)
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!("intercepted"));

        let response = reactor
            .dispatch(r#"{"jsonrpc":"2.0","id":2,"method":"echo"}"#)
            .await
            .unwrap();
        assert_eq!(response.into_result().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn serve_until_eof() {
        let reactor = Arc::new(reactor());
        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);

        let serving = {
            let reactor = reactor.clone();
            tokio::spawn(async move { reactor.serve(server_read, server_write).await })
        };

        client
            .write_all(
                concat!(
                    r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"a":1}}"#,
                    "\n\n",
                    r#"{"jsonrpc":"2.0","method":"echo"}"#,
                    "\n",
                    r#"{"jsonrpc":"2.0","id":2,"method":"missing"}"#,
                    "\n",
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut lines = BufReader::new(client_read).lines();
        let mut responses = Vec::new();
        for _ in 0..2 {
            let line = lines.next_line().await.unwrap().unwrap();
            responses.push(serde_json::from_str::<JsonRpcResponse>(&line).unwrap());
        }
        responses.sort_by_key(|r| r.id.as_ref().map(|id| id.to_string()));
        assert_eq!(responses[0].id, Some(RequestId::Number(1)));
        assert!(responses[1].is_error());

        client_write.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(reactor.supervisor().state(), ReactorState::Stopped);
    }

    #[tokio::test]
    async fn bad_bytes_do_not_end_the_session() {
        let reactor = Arc::new(Reactor::new(ReactorConfig {
            max_line_bytes: 128,
            ..ReactorConfig::default()
        }));
        reactor.registry().register_blocking("echo", ParamSpec::Open, Ok);

        let mut input = b"\xff\xfe\n".to_vec();
        input.extend_from_slice(&[b'x'; 200]);
        input.push(b'\n');
        input.extend_from_slice(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"echo\"}\n");

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let serving = {
            let reactor = reactor.clone();
            tokio::spawn(async move { reactor.serve(server_read, server_write).await })
        };

        client_write.write_all(&input).await.unwrap();
        client_write.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str::<JsonRpcResponse>(&line).unwrap());
        }
        assert_eq!(responses.len(), 3);

        let (answered, rejected): (Vec<_>, Vec<_>) =
            responses.into_iter().partition(|r| r.id.is_some());
        assert_eq!(answered[0].id, Some(RequestId::Number(1)));
        assert!(!answered[0].is_error());
        for response in rejected {
            assert_eq!(error_code(response), error_codes::PARSE_ERROR);
        }
    }

    #[tokio::test]
    async fn serves_only_once() {
        let reactor = Arc::new(reactor());
        reactor.serve(tokio::io::empty(), tokio::io::sink()).await.unwrap();
        assert_eq!(reactor.supervisor().state(), ReactorState::Stopped);

        let (_client, server) = tokio::io::duplex(64);
        let (server_read, server_write) = tokio::io::split(server);
        let err = reactor.serve(server_read, server_write).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyServed));
        assert_eq!(reactor.supervisor().state(), ReactorState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_calls() {
        let reactor = Arc::new(Reactor::new(ReactorConfig::default()));
        reactor.registry().register_async("nap", ParamSpec::Open, |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, HandlerError>(json!("rested"))
        });

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, mut client_write) = tokio::io::split(client);

        let serving = {
            let reactor = reactor.clone();
            tokio::spawn(async move { reactor.serve(server_read, server_write).await })
        };

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"nap\"}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut states = reactor.supervisor().subscribe();
        reactor.supervisor().shutdown();
        states.wait_for(|s| *s == ReactorState::Stopped).await.unwrap();
        serving.await.unwrap().unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: JsonRpcResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.into_result().unwrap(), json!("rested"));
    }
}
