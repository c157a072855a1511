//! Shutdown coordination for a reactor.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle of a reactor's read loop. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReactorState {
    /// Not serving yet.
    Idle,
    /// Reading and dispatching input.
    Running,
    /// No longer reading; in-flight calls are finishing.
    Draining,
    /// All work finished.
    Stopped,
}

/// Owns the shutdown signal and the published state of one reactor.
///
/// Cheap to clone; every clone controls the same reactor.
#[derive(Debug, Clone)]
pub struct Supervisor {
    token: CancellationToken,
    state: Arc<watch::Sender<ReactorState>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ReactorState::Idle);
        Self {
            token: CancellationToken::new(),
            state: Arc::new(state),
        }
    }

    /// Ask the reactor to stop reading and drain.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn state(&self) -> ReactorState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReactorState> {
        self.state.subscribe()
    }

    /// Move from `Idle` to `Running`. Fails if the reactor has served before.
    pub(crate) fn begin(&self) -> bool {
        self.state.send_if_modified(|current| {
            if *current != ReactorState::Idle {
                return false;
            }
            *current = ReactorState::Running;
            true
        })
    }

    /// Advance to `state`; backward moves are ignored.
    pub(crate) fn set_state(&self, state: ReactorState) {
        let mut previous = state;
        self.state.send_if_modified(|current| {
            previous = *current;
            if state <= *current {
                return false;
            }
            *current = state;
            true
        });
        if previous < state {
            info!(from = ?previous, to = ?state, "reactor state changed");
        }
    }

    /// Trigger shutdown on SIGINT or SIGTERM (Ctrl-C where those do not exist).
    ///
    /// The listener exits once shutdown is requested by any means.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                signal = wait_for_signal() => match signal {
                    Ok(name) => {
                        info!(signal = name, "received termination signal");
                        token.cancel();
                    }
                    Err(e) => warn!(error = %e, "failed to install signal handlers"),
                },
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_is_shared_across_clones() {
        let supervisor = Supervisor::new();
        let clone = supervisor.clone();
        assert!(!supervisor.is_shutdown_requested());

        clone.shutdown();
        clone.shutdown();
        assert!(supervisor.is_shutdown_requested());
        tokio::time::timeout(Duration::from_secs(1), supervisor.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn state_is_observable() {
        let supervisor = Supervisor::new();
        let mut rx = supervisor.subscribe();
        assert_eq!(supervisor.state(), ReactorState::Idle);

        assert!(supervisor.begin());
        assert_eq!(supervisor.state(), ReactorState::Running);

        supervisor.set_state(ReactorState::Draining);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ReactorState::Draining);
    }

    #[test]
    fn state_never_moves_backward() {
        let supervisor = Supervisor::new();
        supervisor.set_state(ReactorState::Stopped);

        supervisor.set_state(ReactorState::Running);
        assert_eq!(supervisor.state(), ReactorState::Stopped);
        assert!(!supervisor.begin());
        assert_eq!(supervisor.state(), ReactorState::Stopped);
    }

    #[tokio::test]
    async fn signal_listener_exits_on_shutdown() {
        let supervisor = Supervisor::new();
        let listener = supervisor.listen_for_signals();
        supervisor.shutdown();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
