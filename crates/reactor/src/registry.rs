//! Named methods the reactor can invoke.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::HandlerError;

pub type HandlerResult = Result<Value, HandlerError>;

pub type AsyncMethod = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type BlockingMethod = Arc<dyn Fn(Value) -> HandlerResult + Send + Sync>;

/// Which named params a method receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSpec {
    /// Only these names are passed on; others are dropped.
    Fixed(Vec<String>),
    /// Everything is passed on.
    Open,
}

impl ParamSpec {
    pub fn fixed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fixed(names.into_iter().map(Into::into).collect())
    }

    /// Apply the descriptor to incoming params. Missing params become `{}`.
    pub fn bind(&self, method: &str, params: Option<Value>) -> Value {
        let params = match params {
            None | Some(Value::Null) => return Value::Object(Map::new()),
            Some(params) => params,
        };

        let (ParamSpec::Fixed(names), Value::Object(map)) = (self, &params) else {
            return params;
        };

        let (kept, rejected): (Map<String, Value>, Map<String, Value>) = map
            .clone()
            .into_iter()
            .partition(|(key, _)| names.contains(key));

        if !rejected.is_empty() {
            let rejected: Vec<&String> = rejected.keys().collect();
            debug!(%method, ?rejected, "dropping undeclared params");
        }
        Value::Object(kept)
    }
}

/// How a method runs.
#[derive(Clone)]
pub enum Method {
    /// Spawned as a task on the runtime.
    Async(AsyncMethod),
    /// Run on the blocking pool, bounded by the worker limit.
    Blocking(BlockingMethod),
}

/// A registered method and its parameter descriptor.
#[derive(Clone)]
pub struct Entry {
    pub params: ParamSpec,
    pub method: Method,
}

/// Thread-safe map of method names to handlers. Re-registering a name
/// replaces the previous entry.
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Entry>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, entry: Entry) {
        let name = name.into();
        debug!(method = %name, "registering method");
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, entry);
    }

    pub fn register_async<F, Fut>(&self, name: impl Into<String>, params: ParamSpec, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let method: AsyncMethod = Arc::new(move |params| Box::pin(f(params)));
        self.register(
            name,
            Entry {
                params,
                method: Method::Async(method),
            },
        );
    }

    pub fn register_blocking<F>(&self, name: impl Into<String>, params: ParamSpec, f: F)
    where
        F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(
            name,
            Entry {
                params,
                method: Method::Blocking(Arc::new(f)),
            },
        );
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Entry> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
