//! Wire protocol types.
//!
//! Two channels:
//! - **Client socket**: one `Request` and one `Response` per connection
//! - **Session pipes** (stdin/stdout of a session subprocess): Init, Execute,
//!   Shutdown requests answered by Ready, Done, Failed

use serde::{Deserialize, Serialize};

use crate::engine::EngineStatus;
use crate::task::{Credential, TaskId, TaskOutcome};

/// Messages from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Queue an activity for execution.
    Submit {
        activity: serde_json::Value,
        credential: Credential,
        #[serde(default)]
        stabilization_delay_ms: u64,
    },

    /// Ask for the result of a previously submitted task.
    Poll { id: TaskId },

    Status,

    /// Ask the server to tear down and exit.
    Shutdown,
}

/// Messages from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Accepted { id: TaskId },

    /// Queue at capacity; retry later.
    QueueFull,

    Completed { outcome: TaskOutcome },

    /// Never submitted, or the result already expired.
    NotFound,

    /// Still queued or executing; poll again.
    NotCompleted,

    Status { status: EngineStatus },

    ShuttingDown,

    /// The engine cannot take requests right now (not running).
    Rejected { reason: String },
}

/// Messages from the worker to a session subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRequest {
    /// Initial configuration sent immediately after spawn (must be first message).
    Init {
        read_file_timeout_secs: u64,
        use_virtual_display: bool,
    },

    Execute {
        id: TaskId,
        activity: serde_json::Value,
        credential: Credential,
        stabilization_delay_ms: u64,
    },

    Shutdown,
}

/// Messages from a session subprocess to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionResponse {
    Ready,

    Done {
        id: TaskId,
        #[serde(default)]
        value: serde_json::Value,
    },

    Failed { id: TaskId, error: String },
}
