//! drudge: bounded single-worker job queue served over a Unix socket.

pub mod bridge;
pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod lock;
pub mod queue;
pub mod session;
pub mod task;
pub mod transport;
pub mod version;
pub mod worker;

pub use cache::ResultCache;
pub use client::{Client, ClientError, SubmitOutcome};
pub use config::{ConfigError, EngineConfig, ServerConfig};
pub use engine::{Engine, EngineError, EngineState, EngineStatus, Lookup, SubmitError};
pub use lock::{AdvisoryLock, LockError};
pub use queue::{EnqueueError, TaskQueue};
pub use session::{
    ExecuteError, ProcessSessionFactory, Session, SessionError, SessionFactory, SessionOptions,
};
pub use task::{Credential, Task, TaskId, TaskOutcome};
pub use transport::{Server, ServerError, serve, shutdown_signal};
pub use version::{DRUDGE_VERSION, PROTOCOL_VERSION, VersionInfo};
pub use worker::{WorkerSession, WorkerStats};
