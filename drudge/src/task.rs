//! Task and result types shared by the queue, cache, worker and wire protocol.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Unique identifier for a submitted task.
///
/// UUID v4, so ids are never reused across restarts of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credential handed to the executor alongside the activity.
///
/// Carried verbatim over the wire but redacted from `Debug` output so it never
/// ends up in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A unit of work waiting in (or taken from) the task queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub activity: serde_json::Value,
    pub credential: Credential,
    pub stabilization_delay: Duration,
    pub enqueued_at: Instant,
}

impl Task {
    pub fn new(
        activity: serde_json::Value,
        credential: Credential,
        stabilization_delay: Duration,
    ) -> Self {
        Self {
            id: TaskId::new(),
            activity,
            credential,
            stabilization_delay,
            enqueued_at: Instant::now(),
        }
    }
}

/// Terminal result of one task: the executor's value or a failure marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { value: serde_json::Value },
    Failed { error: String },
}

impl TaskOutcome {
    pub fn succeeded(value: serde_json::Value) -> Self {
        Self::Succeeded { value }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Succeeded { value } => Some(value),
            Self::Failed { .. } => None,
        }
    }
}
