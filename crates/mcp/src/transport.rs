//! Child-process transport: one JSON-RPC message per line over stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::framing::{Frame, read_frame};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId};

/// Maximum accepted line length (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Answers requests initiated by the provider (e.g. `roots/list`).
///
/// Runs on the transport's dispatch task, so no other inbound message is
/// processed until it returns. Returning `None` leaves the request unanswered.
pub trait PeerRequestHandler: Send + Sync {
    fn handle(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse>;
}

/// Timing and framing limits for a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// How long to wait for a voluntary exit after stdin is closed.
    pub close_grace_ms: u64,
    /// How long to wait after SIGTERM before killing.
    pub terminate_grace_ms: u64,
    /// Lines longer than this are dropped.
    pub max_line_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            close_grace_ms: 2_000,
            terminate_grace_ms: 1_000,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl TransportOptions {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

type PendingMap = HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>;

/// State shared between the transport handle and its background tasks.
struct Shared {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    pending: std::sync::Mutex<PendingMap>,
    exited: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(Error::Write {
                name: self.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"),
            });
        };
        write_all_line(stdin, line)
            .await
            .map_err(|source| Error::Write {
                name: self.name.clone(),
                source,
            })
    }

    /// Fail every outstanding call; later requests fail immediately.
    fn fail_pending(&self) {
        self.exited.store(true, Ordering::SeqCst);
        // Dropping the senders wakes each waiter with a closed channel.
        self.pending().clear();
    }
}

async fn write_all_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Handle to a provider process speaking newline-delimited JSON-RPC.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    options: TransportOptions,
    peer_handler: Option<Arc<dyn PeerRequestHandler>>,
    shared: Arc<Shared>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicI64,
    started: AtomicBool,
    closed: AtomicBool,
}

impl StdioTransport {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            options: TransportOptions::default(),
            peer_handler: None,
            shared: Arc::new(Shared {
                name: name.into(),
                stdin: Mutex::new(None),
                pending: std::sync::Mutex::new(HashMap::new()),
                exited: AtomicBool::new(false),
            }),
            child: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_peer_handler(mut self, handler: Arc<dyn PeerRequestHandler>) -> Self {
        self.peer_handler = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Spawn the provider and its reader tasks. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        let name = &self.shared.name;
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            name: name.clone(),
            source,
        })?;

        let missing = |stream: &str| Error::Spawn {
            name: name.clone(),
            source: std::io::Error::other(format!("failed to capture {stream}")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        *self.shared.stdin.lock().await = Some(stdin);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(read_stdout(
            name.clone(),
            stdout,
            tx,
            self.options.max_line_bytes,
        )));
        tasks.push(tokio::spawn(dispatch(
            self.shared.clone(),
            rx,
            self.peer_handler.clone(),
        )));
        tasks.push(tokio::spawn(drain_stderr(name.clone(), stderr)));

        debug!(provider = %name, command = %self.command, pid = ?child.id(), "provider started");
        *slot = Some(child);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True once the provider's stdout has closed or the transport was closed.
    pub fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    /// Write one message as a single line.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_started() {
            return Err(Error::NotConnected);
        }
        let line = serde_json::to_string(message)?;
        trace!(provider = %self.shared.name, %line, "send");
        self.shared.write_line(&line).await
    }

    /// Send a request and return the slot its response will arrive in.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<PendingCall> {
        if !self.is_started() {
            return Err(Error::NotConnected);
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut request = JsonRpcRequest::new(id.clone(), method);
        request.params = params;

        // Registered before the write so a fast response cannot miss it.
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id.clone(), tx);
        let call = PendingCall {
            id,
            method: method.to_string(),
            rx: Some(rx),
            shared: self.shared.clone(),
        };

        if self.has_exited() {
            return Err(Error::ServerExited);
        }
        self.send(&Message::Request(request)).await?;
        Ok(call)
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        self.send(&Message::Notification(notification)).await
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Shut the provider down, escalating from closing stdin to SIGTERM to
    /// SIGKILL. Never fails; only the first call does any work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping stdin signals EOF to the provider.
        self.shared.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            terminate(&self.shared.name, &mut child, &self.options).await;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.shared.fail_pending();
        debug!(provider = %self.shared.name, "transport closed");
    }
}

/// A request awaiting its response.
///
/// Dropping it, or letting [`PendingCall::wait`] time out, removes the slot.
pub struct PendingCall {
    id: RequestId,
    method: String,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
    shared: Arc<Shared>,
}

impl PendingCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, or fail with [`Error::Timeout`].
    pub async fn wait(mut self, deadline: Duration) -> Result<JsonRpcResponse> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::ServerExited);
        };
        match timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ServerExited),
            Err(_) => Err(Error::Timeout {
                method: std::mem::take(&mut self.method),
                timeout: deadline,
            }),
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

async fn read_stdout(
    name: String,
    stdout: ChildStdout,
    tx: mpsc::UnboundedSender<Message>,
    max_line_bytes: usize,
) {
    let mut reader = BufReader::new(stdout);

    loop {
        let line = match read_frame(&mut reader, max_line_bytes).await {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::Eof) => break,
            Ok(Frame::Oversized(len)) => {
                warn!(provider = %name, len, max = max_line_bytes, "dropping oversized line");
                continue;
            }
            Ok(Frame::InvalidUtf8) => {
                warn!(provider = %name, "dropping line that is not valid UTF-8");
                continue;
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "failed to read provider stdout");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Message::parse(line) {
            Ok(message) => {
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => warn!(provider = %name, error = %e, %line, "dropping unparseable line"),
        }
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    peer_handler: Option<Arc<dyn PeerRequestHandler>>,
) {
    let name = shared.name.clone();

    while let Some(message) = rx.recv().await {
        match message {
            Message::Response(response) => {
                let slot = response.id.as_ref().and_then(|id| shared.pending().remove(id));
                match slot {
                    // The waiter may have given up already.
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(provider = %name, id = ?response.id, "no pending call for response")
                    }
                }
            }
            Message::Request(request) => {
                let answer = peer_handler.as_ref().and_then(|h| h.handle(&request));
                let Some(answer) = answer else {
                    debug!(
                        provider = %name,
                        method = %request.method,
                        id = %request.id,
                        "peer request ignored"
                    );
                    continue;
                };
                let written = match serde_json::to_string(&answer) {
                    Ok(line) => shared.write_line(&line).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    warn!(
                        provider = %name,
                        method = %request.method,
                        error = %e,
                        "failed to answer peer request"
                    );
                }
            }
            Message::Notification(notification) => {
                debug!(provider = %name, method = %notification.method, "peer notification");
            }
        }
    }

    shared.fail_pending();
    debug!(provider = %name, "provider stdout closed");
}

async fn drain_stderr(name: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    loop {
        match read_frame(&mut reader, MAX_LINE_BYTES).await {
            Ok(Frame::Line(line)) => warn!(provider = %name, "{line}"),
            Ok(Frame::Oversized(len)) => warn!(provider = %name, len, "oversized stderr line"),
            Ok(Frame::InvalidUtf8) => {}
            Ok(Frame::Eof) | Err(_) => break,
        }
    }
}

async fn terminate(name: &str, child: &mut Child, options: &TransportOptions) {
    if let Ok(status) = timeout(options.close_grace(), child.wait()).await {
        debug!(provider = %name, status = ?status, "provider exited");
        return;
    }

    send_terminate(child);
    if let Ok(status) = timeout(options.terminate_grace(), child.wait()).await {
        debug!(provider = %name, status = ?status, "provider terminated");
        return;
    }

    warn!(provider = %name, "provider ignored termination, killing");
    if let Err(e) = child.kill().await {
        warn!(provider = %name, error = %e, "failed to kill provider");
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // ESRCH only means it already exited.
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{ListRootsResult, Root};
    use serde_json::json;
    use std::time::Instant;

    fn sh(script: &str) -> StdioTransport {
        StdioTransport::new(
            "test",
            "sh",
            vec!["-c".to_string(), script.to_string()],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn spawn_failure() {
        let transport =
            StdioTransport::new("missing", "/nonexistent/provider", vec![], HashMap::new());
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn request_before_start_is_rejected() {
        let transport = sh("cat");
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn timeout_removes_pending_slot() {
        let transport = sh("cat > /dev/null");
        transport.start().await.unwrap();
        transport.start().await.unwrap();

        let call = transport.request("tools/list", None).await.unwrap();
        assert_eq!(call.id(), &RequestId::Number(1));
        assert_eq!(transport.pending_count(), 1);

        let started = Instant::now();
        let err = call.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.pending_count(), 0);

        let next = transport.request("tools/list", None).await.unwrap();
        assert_eq!(next.id(), &RequestId::Number(2));
        drop(next);
        assert_eq!(transport.pending_count(), 0);

        transport.close().await;
    }

    #[tokio::test]
    async fn skips_noise_and_matches_by_id() {
        let transport = sh(r#"read req
echo 'not json at all'
echo ''
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
echo '{"jsonrpc":"2.0","id":99,"result":"stray"}'
echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'
cat > /dev/null"#);
        transport.start().await.unwrap();

        let call = transport.request("ping", None).await.unwrap();
        let response = call.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"ok": true}));

        transport.close().await;
    }

    #[tokio::test]
    async fn drops_oversized_and_non_utf8_lines() {
        let transport = sh(r#"read req
printf '{"jsonrpc":"2.0","id":1,"result":"\377"}\n'
echo '{"jsonrpc":"2.0","id":1,"result":"0123456789012345678901234567890123456789"}'
echo '{"jsonrpc":"2.0","id":1,"result":"ok"}'
cat > /dev/null"#)
        .with_options(TransportOptions {
            max_line_bytes: 64,
            ..TransportOptions::default()
        });
        transport.start().await.unwrap();

        let call = transport.request("ping", None).await.unwrap();
        let response = call.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.into_result().unwrap(), json!("ok"));

        transport.close().await;
    }

    #[test]
    fn pending_call_debug_names_the_request() {
        let transport = sh("cat");
        let call = PendingCall {
            id: RequestId::Number(7),
            method: "tools/call".to_string(),
            rx: None,
            shared: transport.shared.clone(),
        };
        let debug = format!("{call:?}");
        assert!(debug.contains("tools/call"));
        assert!(debug.contains('7'));
    }

    struct Roots;

    impl PeerRequestHandler for Roots {
        fn handle(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
            (request.method == "roots/list").then(|| {
                let result = ListRootsResult {
                    roots: vec![Root {
                        uri: "file:///tmp".to_string(),
                        name: Some("tmp".to_string()),
                    }],
                };
                JsonRpcResponse::success(request.id.clone(), serde_json::to_value(result).unwrap())
            })
        }
    }

    #[tokio::test]
    async fn answers_peer_request_mid_call() {
        let transport = sh(r#"read req
echo '{"jsonrpc":"2.0","id":"r1","method":"roots/list"}'
read reply
case "$reply" in
  *file:///tmp*) echo '{"jsonrpc":"2.0","id":1,"result":"got-roots"}' ;;
  *) echo '{"jsonrpc":"2.0","id":1,"result":"no-roots"}' ;;
esac
cat > /dev/null"#)
        .with_peer_handler(Arc::new(Roots));
        transport.start().await.unwrap();

        let call = transport.request("tools/list", None).await.unwrap();
        let response = call.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.into_result().unwrap(), json!("got-roots"));

        transport.close().await;
    }

    #[tokio::test]
    async fn eof_fails_pending_calls() {
        let transport = sh("read req; exit 0");
        transport.start().await.unwrap();

        let call = transport.request("tools/list", None).await.unwrap();
        let err = call.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::ServerExited));
        assert_eq!(transport.pending_count(), 0);

        transport.close().await;
    }

    #[tokio::test]
    async fn close_is_quick_for_cooperative_provider() {
        let transport = sh("cat > /dev/null");
        transport.start().await.unwrap();

        let started = Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let err = transport.notify("ping", None).await.unwrap_err();
        assert!(matches!(err, Error::Write { .. }));
    }

    #[tokio::test]
    async fn close_kills_provider_ignoring_sigterm() {
        let options = TransportOptions {
            close_grace_ms: 100,
            terminate_grace_ms: 100,
            ..TransportOptions::default()
        };
        let transport = sh(r#"trap "" TERM; while :; do sleep 0.1; done"#).with_options(options);
        transport.start().await.unwrap();

        let started = Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_secs(3));

        // Idempotent.
        transport.close().await;
        assert!(transport.has_exited());
    }
}
