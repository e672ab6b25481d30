//! Execution sessions: the long-lived resource the worker runs tasks in.
//!
//! A [`SessionFactory`] creates sessions; the worker owns at most one
//! [`Session`] at a time and replaces it when it is recycled or lost.
//! [`process`] provides a subprocess-backed implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::task::Task;

pub mod process;
#[cfg(test)]
pub(crate) mod testing;

pub use process::ProcessSessionFactory;

/// Options every session is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Bound on reading task artifacts, enforced by the session.
    pub read_file_timeout: Duration,
    pub use_virtual_display: bool,
}

impl From<&EngineConfig> for SessionOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            read_file_timeout: config.read_file_timeout,
            use_virtual_display: config.use_virtual_display,
        }
    }
}

/// Failure to bring up a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start session: {0}")]
    Start(String),

    #[error("session i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session protocol error: {0}")]
    Protocol(String),

    #[error("session did not become ready within {0:?}")]
    ReadyTimeout(Duration),
}

/// Failure while executing one task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    /// The activity failed; the session is still usable.
    #[error("{0}")]
    Activity(String),

    /// The session can no longer be used and must be recreated.
    #[error("session lost: {0}")]
    SessionLost(String),
}

impl ExecuteError {
    pub fn activity(message: impl Into<String>) -> Self {
        Self::Activity(message.into())
    }

    pub fn session_lost(message: impl Into<String>) -> Self {
        Self::SessionLost(message.into())
    }
}

/// One live execution session.
#[async_trait]
pub trait Session: Send {
    /// Run one task's activity with its credential, honouring the task's
    /// stabilization delay. Not cancellable once started.
    async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecuteError>;

    /// Release the underlying resource.
    async fn close(self: Box<Self>);
}

/// Creates sessions for the worker.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    async fn create(&self, options: &SessionOptions) -> Result<Box<dyn Session>, SessionError>;
}
