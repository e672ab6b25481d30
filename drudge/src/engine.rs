//! Engine: owns the task queue, the result cache and the one worker.
//!
//! ```text
//!   put(activity) --> TaskQueue --> WorkerSession --> ResultCache <-- get(id)
//! ```
//!
//! `put` and `get` are synchronous and never wait on the worker. Queue and
//! cache are built fresh on every `start` and dropped on `stop`.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{self, ResultCache};
use crate::config::{ConfigError, EngineConfig};
use crate::queue::{EnqueueError, TaskQueue};
use crate::session::SessionFactory;
use crate::task::{Credential, Task, TaskId, TaskOutcome};
use crate::version::VersionInfo;
use crate::worker::{WorkerSession, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the engine for the `status` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub queue_len: usize,
    /// `None` when the queue is unbounded.
    pub queue_capacity: Option<usize>,
    pub in_flight: Option<TaskId>,
    /// Includes expired entries not yet swept.
    pub cached_results: usize,
    pub completed_total: u64,
    pub session_restarts: u64,
    pub version: VersionInfo,
}

/// Answer to a result lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Completed(TaskOutcome),
    /// Still queued or executing.
    NotCompleted,
    /// Never submitted, already expired, or the engine is not running.
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("engine is {state}, not accepting tasks")]
    NotRunning { state: EngineState },
}

impl From<EnqueueError> for SubmitError {
    fn from(e: EnqueueError) -> Self {
        match e {
            EnqueueError::QueueFull { capacity } => Self::QueueFull { capacity },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine cannot start while {0}")]
    AlreadyStarted(EngineState),
}

/// Resources that only exist while the engine runs.
struct Running {
    queue: Arc<TaskQueue>,
    cache: Arc<ResultCache>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

struct Inner {
    state: EngineState,
    running: Option<Running>,
}

pub struct Engine {
    config: EngineConfig,
    factory: Arc<dyn SessionFactory>,
    inner: StdMutex<Inner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            inner: StdMutex::new(Inner {
                state: EngineState::Stopped,
                running: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Engine mutex poisoned - recovering state");
            poisoned.into_inner()
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Build the queue and cache and spawn the worker and the result sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != EngineState::Stopped {
            return Err(EngineError::AlreadyStarted(inner.state));
        }
        inner.state = EngineState::Starting;

        let queue = Arc::new(TaskQueue::new(self.config.queue_size));
        let cache = Arc::new(ResultCache::new(self.config.result_ttl));
        let shutdown = CancellationToken::new();

        let worker = WorkerSession::new(Arc::clone(&self.factory), &self.config);
        let stats = worker.stats();
        let worker = tokio::spawn(worker.run(
            Arc::clone(&queue),
            Arc::clone(&cache),
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(cache::run_sweeper(
            Arc::clone(&cache),
            self.config.sweep_interval(),
            shutdown.clone(),
        ));

        inner.running = Some(Running {
            queue,
            cache,
            stats,
            shutdown,
            worker,
            sweeper,
        });
        inner.state = EngineState::Running;
        tracing::info!(
            queue_size = self.config.queue_size,
            result_ttl_secs = self.config.result_ttl.as_secs(),
            tasks_before_session_restart = self.config.tasks_before_session_restart,
            "Engine started"
        );
        Ok(())
    }

    /// Stop the worker after its in-flight task and release everything.
    ///
    /// Tasks still queued are discarded; returns how many. Stopping an engine
    /// that is not running is a no-op returning 0.
    pub async fn stop(&self) -> usize {
        let running = {
            let mut inner = self.lock();
            if inner.state != EngineState::Running {
                tracing::debug!(state = %inner.state, "Engine not running, nothing to stop");
                return 0;
            }
            inner.state = EngineState::Stopping;
            inner.running.take()
        };
        let Some(running) = running else {
            self.lock().state = EngineState::Stopped;
            return 0;
        };

        tracing::info!(in_flight = ?running.queue.in_flight(), "Stopping engine");
        running.shutdown.cancel();
        if let Err(e) = running.worker.await {
            tracing::error!(error = %e, "Worker task failed");
        }
        if let Err(e) = running.sweeper.await {
            tracing::error!(error = %e, "Sweeper task failed");
        }

        let discarded = running.queue.drain().len();
        if discarded > 0 {
            tracing::info!(discarded, "Discarded queued tasks at shutdown");
        }
        running.cache.clear();

        self.lock().state = EngineState::Stopped;
        tracing::info!(
            completed_total = running.stats.completed_total(),
            "Engine stopped"
        );
        discarded
    }

    /// Queue an activity. Returns as soon as it is admitted.
    pub fn put(
        &self,
        activity: serde_json::Value,
        credential: Credential,
        stabilization_delay: Duration,
    ) -> Result<TaskId, SubmitError> {
        let queue = {
            let inner = self.lock();
            match (&inner.running, inner.state) {
                (Some(running), EngineState::Running) => Arc::clone(&running.queue),
                (_, state) => return Err(SubmitError::NotRunning { state }),
            }
        };
        let id = queue.enqueue(Task::new(activity, credential, stabilization_delay))?;
        Ok(id)
    }

    /// Look up a task's result without waiting.
    pub fn get(&self, id: TaskId) -> Lookup {
        let (queue, cache) = {
            let inner = self.lock();
            match &inner.running {
                Some(running) => (Arc::clone(&running.queue), Arc::clone(&running.cache)),
                None => return Lookup::NotFound,
            }
        };

        // Pending is checked first: the worker stores a result before it
        // clears the in-flight marker.
        if queue.is_pending(id) {
            return Lookup::NotCompleted;
        }
        match cache.get(id) {
            Some(outcome) => Lookup::Completed(outcome),
            None => Lookup::NotFound,
        }
    }

    pub fn status(&self) -> EngineStatus {
        let inner = self.lock();
        let mut status = EngineStatus {
            state: inner.state,
            queue_len: 0,
            queue_capacity: (self.config.queue_size > 0).then_some(self.config.queue_size),
            in_flight: None,
            cached_results: 0,
            completed_total: 0,
            session_restarts: 0,
            version: VersionInfo::new(),
        };
        if let Some(running) = &inner.running {
            status.queue_len = running.queue.len();
            status.queue_capacity = running.queue.capacity();
            status.in_flight = running.queue.in_flight();
            status.cached_results = running.cache.len();
            status.completed_total = running.stats.completed_total();
            status.session_restarts = running.stats.session_restarts();
        }
        status
    }
}

impl Drop for Engine {
    /// Cancel the worker and sweeper of an engine dropped without `stop`.
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(running) = inner.running.take() {
            tracing::warn!("Engine dropped while running, cancelling worker");
            running.shutdown.cancel();
        }
    }
}
