//! Host-side JSON-RPC dispatch.
//!
//! A [`Reactor`] reads newline-delimited JSON-RPC messages, routes each one
//! through a chain of [`Handler`]s to methods registered in a
//! [`MethodRegistry`], and writes back responses. Method calls always get
//! exactly one response; notifications never get one.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mcp::ToolSchema;
//! use reactor::{Reactor, ReactorConfig, ToolProvider};
//!
//! # async fn example() -> reactor::Result<()> {
//! let reactor = Arc::new(Reactor::new(ReactorConfig::default()));
//!
//! ToolProvider::new("echo", "0.1.0")
//!     .tool(
//!         ToolSchema::builder("echo").required::<String>("text", "what to say").build(),
//!         |args| Ok(args.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string()),
//!     )
//!     .register(reactor.registry());
//!
//! reactor.supervisor().listen_for_signals();
//! reactor.serve_stdio().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod provider;
mod reactor;
mod registry;
mod supervisor;

pub use config::{DEFAULT_MAX_WORKERS, DEFAULT_REQUEST_TIMEOUT, ReactorConfig};
pub use error::{Error, HandlerError, Result};
pub use handler::{Executor, Handler, Incoming, MethodCallHandler, NotificationHandler};
pub use provider::ToolProvider;
pub use reactor::Reactor;
pub use registry::{
    AsyncMethod, BlockingMethod, Entry, HandlerResult, Method, MethodRegistry, ParamSpec,
};
pub use supervisor::{ReactorState, Supervisor};
