//! Engine and server configuration.
//!
//! Built explicitly by the caller and validated when an [`Engine`](crate::Engine)
//! or server is constructed. Nothing in this crate reads the environment.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bounds for `read_file_timeout`, in whole seconds.
pub const READ_FILE_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 5..=60;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "read_file_timeout must be a whole number of seconds between {min} and {max}, got {got:?}"
    )]
    ReadFileTimeout { got: Duration, min: u64, max: u64 },

    #[error("socket path must not be empty")]
    EmptySocketPath,

    #[error("socket path {0} names a directory, expected a file path")]
    SocketPathIsDirectory(String),

    #[error("connection_timeout must be greater than zero")]
    ZeroConnectionTimeout,
}

/// Settings for the task queue, result cache and worker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Task queue capacity. `0` means the queue is unbounded.
    pub queue_size: usize,
    /// Bound handed to the executor for reading task artifacts.
    pub read_file_timeout: Duration,
    /// Passed through to the session factory, not interpreted here.
    pub use_virtual_display: bool,
    /// How long a finished result stays retrievable.
    pub result_ttl: Duration,
    /// Recreate the session after this many completions. `0` never recycles.
    pub tasks_before_session_restart: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_size: 16,
            read_file_timeout: Duration::from_secs(30),
            use_virtual_display: false,
            result_ttl: Duration::from_secs(300),
            tasks_before_session_restart: 50,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_read_file_timeout(mut self, timeout: Duration) -> Self {
        self.read_file_timeout = timeout;
        self
    }

    pub fn with_virtual_display(mut self, enabled: bool) -> Self {
        self.use_virtual_display = enabled;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_tasks_before_session_restart(mut self, n: u32) -> Self {
        self.tasks_before_session_restart = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.read_file_timeout;
        let whole_secs = t.subsec_nanos() == 0;
        if !whole_secs || !READ_FILE_TIMEOUT_RANGE.contains(&t.as_secs()) {
            return Err(ConfigError::ReadFileTimeout {
                got: t,
                min: *READ_FILE_TIMEOUT_RANGE.start(),
                max: *READ_FILE_TIMEOUT_RANGE.end(),
            });
        }
        Ok(())
    }

    /// Interval between background sweeps of expired results.
    pub fn sweep_interval(&self) -> Duration {
        self.result_ttl.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }

    /// Recycling threshold, `None` when recycling is disabled.
    pub fn recycle_after(&self) -> Option<u32> {
        (self.tasks_before_session_restart > 0).then_some(self.tasks_before_session_restart)
    }
}

/// Settings for the socket front end, wrapping the engine's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Listen backlog.
    pub max_connections: u32,
    /// Bound on reading the request and writing the response of one connection.
    pub connection_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/drudge/drudge.sock"),
            max_connections: 128,
            connection_timeout: Duration::from_secs(30),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptySocketPath);
        }
        if self.socket_path.file_name().is_none() || self.socket_path.is_dir() {
            return Err(ConfigError::SocketPathIsDirectory(
                self.socket_path.display().to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectionTimeout);
        }
        self.engine.validate()
    }

    /// Lock held while a server checks for and binds the socket.
    pub fn start_lock_path(&self) -> PathBuf {
        sibling(&self.socket_path, ".start.lock")
    }

    /// Lock held while a server tears down.
    pub fn stop_lock_path(&self) -> PathBuf {
        sibling(&self.socket_path, ".stop.lock")
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
