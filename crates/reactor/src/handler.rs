//! Handler chain and method execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp::{JsonRpcError, JsonRpcResponse, RequestId, error_codes};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::timeout;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::registry::{HandlerResult, Method, MethodRegistry};

/// A validated inbound message with a method.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// `None` for notifications.
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Option<Value>,
}

impl Incoming {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A link in the reactor's handler chain.
///
/// The reactor hands each message to the first handler whose `accepts`
/// returns true. Notifications must never produce a response.
#[async_trait]
pub trait Handler: Send + Sync {
    fn accepts(&self, message: &Incoming) -> bool;

    async fn handle(&self, message: Incoming) -> Option<JsonRpcResponse>;
}

/// Runs registered methods under the per-call deadline.
pub struct Executor {
    registry: Arc<MethodRegistry>,
    workers: Arc<Semaphore>,
    timeout: Duration,
}

impl Executor {
    pub fn new(registry: Arc<MethodRegistry>, max_workers: usize, timeout: Duration) -> Self {
        Self {
            registry,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            timeout,
        }
    }

    /// Look up `method`, bind its params and run it.
    ///
    /// Failures, panics and missed deadlines all come back as error objects.
    pub async fn execute(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        let entry = self
            .registry
            .get(method)
            .ok_or_else(JsonRpcError::method_not_found)?;
        let params = entry.params.bind(method, params);

        // Dropping the handle on timeout aborts the task.
        let task = match entry.method {
            Method::Async(f) => {
                AbortOnDropHandle::new(tokio::spawn(async move { f(params).await }))
            }
            Method::Blocking(f) => {
                let workers = self.workers.clone();
                AbortOnDropHandle::new(tokio::spawn(async move {
                    let permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|_| HandlerError::failed("worker pool closed"))?;
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        f(params)
                    })
                    .await
                    .map_err(join_error)?
                }))
            }
        };

        let outcome: HandlerResult = match timeout(self.timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(join_error(e)),
            Err(_) => return Err(JsonRpcError::request_timeout()),
        };
        outcome.map_err(HandlerError::into_rpc)
    }
}

fn join_error(error: JoinError) -> HandlerError {
    if !error.is_panic() {
        return HandlerError::failed("handler cancelled");
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    HandlerError::Panicked(message)
}

/// Handles messages that carry an id; always answers.
pub struct MethodCallHandler {
    executor: Arc<Executor>,
}

impl MethodCallHandler {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Handler for MethodCallHandler {
    fn accepts(&self, message: &Incoming) -> bool {
        !message.is_notification()
    }

    async fn handle(&self, message: Incoming) -> Option<JsonRpcResponse> {
        let id = message.id?;
        match self.executor.execute(&message.method, message.params).await {
            Ok(result) => Some(JsonRpcResponse::success(id, result)),
            Err(error) => {
                if error.code == error_codes::METHOD_NOT_FOUND {
                    debug!(method = %message.method, %id, "method not found");
                } else {
                    warn!(method = %message.method, %id, %error, "method call failed");
                }
                Some(JsonRpcResponse::failure(Some(id), error))
            }
        }
    }
}

/// Handles messages without an id; never answers.
pub struct NotificationHandler {
    executor: Arc<Executor>,
}

impl NotificationHandler {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Handler for NotificationHandler {
    fn accepts(&self, message: &Incoming) -> bool {
        message.is_notification()
    }

    async fn handle(&self, message: Incoming) -> Option<JsonRpcResponse> {
        match self.executor.execute(&message.method, message.params).await {
            Ok(_) => {}
            Err(error) if error.code == error_codes::METHOD_NOT_FOUND => {
                debug!(method = %message.method, "no handler for notification");
            }
            Err(error) => {
                warn!(method = %message.method, %error, "notification handler failed");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ParamSpec;
    use serde_json::json;

    fn executor(registry: Arc<MethodRegistry>) -> Executor {
        Executor::new(registry, 2, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn runs_async_and_blocking_methods() {
        let registry = Arc::new(MethodRegistry::new());
        registry.register_async("double", ParamSpec::fixed(["n"]), |params| async move {
            let n = params["n"].as_i64().unwrap_or_default();
            Ok::<_, HandlerError>(json!(n * 2))
        });
        registry.register_blocking("echo", ParamSpec::Open, Ok);

        let executor = executor(registry);
        assert_eq!(executor.execute("double", Some(json!({"n": 21}))).await.unwrap(), json!(42));
        assert_eq!(
            executor.execute("echo", Some(json!({"a": true}))).await.unwrap(),
            json!({"a": true})
        );
    }

    async fn explode(_: Value) -> HandlerResult {
        panic!("async kaboom")
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let registry = Arc::new(MethodRegistry::new());
        registry.register_blocking("explode", ParamSpec::Open, |_| panic!("kaboom"));
        registry.register_async("explode_async", ParamSpec::Open, explode);

        let executor = executor(registry);
        let err = executor.execute("explode", None).await.unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert_eq!(err.message, "Internal error: kaboom");

        let err = executor.execute("explode_async", None).await.unwrap_err();
        assert_eq!(err.message, "Internal error: async kaboom");
    }

    #[tokio::test]
    async fn slow_methods_time_out() {
        let registry = Arc::new(MethodRegistry::new());
        registry.register_async("slow", ParamSpec::Open, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, HandlerError>(Value::Null)
        });

        let err = executor(registry).execute("slow", None).await.unwrap_err();
        assert_eq!(err.code, error_codes::REQUEST_TIMEOUT);
        assert_eq!(err.message, "Request timeout");
    }

    #[tokio::test]
    async fn notifications_never_answer() {
        let registry = Arc::new(MethodRegistry::new());
        registry.register_blocking("fail", ParamSpec::Open, |_| Err(HandlerError::failed("nope")));
        let handler = NotificationHandler::new(Arc::new(executor(registry)));

        for method in ["fail", "missing"] {
            let message = Incoming {
                id: None,
                method: method.to_string(),
                params: None,
            };
            assert!(handler.accepts(&message));
            assert!(handler.handle(message).await.is_none());
        }
    }

    #[tokio::test]
    async fn calls_always_answer() {
        let registry = Arc::new(MethodRegistry::new());
        let handler = MethodCallHandler::new(Arc::new(executor(registry)));

        let message = Incoming {
            id: Some(RequestId::Number(9)),
            method: "missing".to_string(),
            params: None,
        };
        assert!(handler.accepts(&message));
        let response = handler.handle(message).await.unwrap();
        assert_eq!(response.id, Some(RequestId::Number(9)));
        assert_eq!(response.into_result().unwrap_err().code, error_codes::METHOD_NOT_FOUND);
    }
}
