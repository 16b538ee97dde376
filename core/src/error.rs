//! Typed failure taxonomy for the sandbox dispatcher and the surface collaborator.
//!
//! Call sites at the session-manager and coalescer layers match on these
//! instead of propagating `?` past a session boundary: one session's error
//! must never unwind another session.

use thiserror::Error;

/// Failures from the container-command boundary (`ContainerRuntime`) and the
/// dispatcher built on top of it.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("failed to launch command: {0}")]
    LaunchFailed(String),

    #[error("container is not running")]
    HealthDown,

    #[error("resource limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// The `(-1, message)` shape the one-shot `execute` contract publishes to callers,
    /// matching the historical "no raw exit status available" convention.
    pub fn as_exit(&self) -> (String, i32) {
        (self.to_string(), -1)
    }
}

/// Failures from publishing to the external message surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("surface message is gone")]
    Gone,

    #[error("surface error: {0}")]
    Other(String),
}
