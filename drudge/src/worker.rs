//! The single worker loop.
//!
//! Pulls one task at a time from the [`TaskQueue`], runs it in the current
//! session, stores the outcome in the [`ResultCache`] and recycles the session
//! every `tasks_before_session_restart` completions.
//!
//! ```text
//!         dequeue            execute          put + finish
//!  Idle ----------> Executing --------> store ------------> Idle
//!   |                                                         |
//!   +-- shutdown: close session, exit     recycle if due <----+
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::queue::TaskQueue;
use crate::session::{ExecuteError, Session, SessionError, SessionFactory, SessionOptions};
use crate::task::{Task, TaskOutcome};

/// Counters shared with the engine for status reporting.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed_total: AtomicU64,
    session_restarts: AtomicU64,
}

impl WorkerStats {
    pub fn completed_total(&self) -> u64 {
        self.completed_total.load(Ordering::Relaxed)
    }

    /// Sessions torn down and replaced, by recycling or after being lost.
    pub fn session_restarts(&self) -> u64 {
        self.session_restarts.load(Ordering::Relaxed)
    }
}

pub struct WorkerSession {
    factory: Arc<dyn SessionFactory>,
    options: SessionOptions,
    recycle_after: Option<u32>,
    session: Option<Box<dyn Session>>,
    completions_since_restart: u32,
    stats: Arc<WorkerStats>,
}

impl WorkerSession {
    pub fn new(factory: Arc<dyn SessionFactory>, config: &EngineConfig) -> Self {
        Self {
            factory,
            options: SessionOptions::from(config),
            recycle_after: config.recycle_after(),
            session: None,
            completions_since_restart: 0,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` is cancelled. A task already executing when
    /// shutdown arrives is finished and its result stored first.
    pub async fn run(
        mut self,
        queue: Arc<TaskQueue>,
        cache: Arc<ResultCache>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(recycle_after = ?self.recycle_after, "Worker started");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Worker stopped before first session was ready");
                return;
            }
            _ = self.replace_session() => {}
        }

        while let Some(task) = queue.dequeue(&shutdown).await {
            let id = task.id;
            tracing::debug!(
                task_id = %id,
                waited_ms = task.enqueued_at.elapsed().as_millis() as u64,
                "Executing task"
            );

            let outcome = self.execute(&task).await;
            match &outcome {
                TaskOutcome::Succeeded { .. } => tracing::debug!(task_id = %id, "Task succeeded"),
                TaskOutcome::Failed { error } => {
                    tracing::warn!(task_id = %id, error = %error, "Task failed")
                }
            }

            self.stats.completed_total.fetch_add(1, Ordering::Relaxed);
            // Store before finishing so a concurrent poll never sees the id as unknown.
            cache.put(id, outcome);
            queue.finish(id);

            self.record_completion(&shutdown).await;
        }

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        tracing::info!(
            completed_total = self.stats.completed_total(),
            "Worker stopped"
        );
    }

    async fn execute(&mut self, task: &Task) -> TaskOutcome {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => match self.create_session().await {
                Ok(session) => session,
                Err(e) => return TaskOutcome::failed(format!("session unavailable: {}", e)),
            },
        };

        let result = AssertUnwindSafe(session.execute(task)).catch_unwind().await;
        match result {
            Ok(Ok(value)) => {
                self.session = Some(session);
                TaskOutcome::succeeded(value)
            }
            Ok(Err(ExecuteError::Activity(error))) => {
                self.session = Some(session);
                TaskOutcome::failed(error)
            }
            Ok(Err(lost @ ExecuteError::SessionLost(_))) => {
                tracing::warn!(task_id = %task.id, error = %lost, "Session lost, replacing");
                self.discard(session).await;
                TaskOutcome::failed(lost.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = %task.id, panic = %message, "Executor panicked");
                self.discard(session).await;
                TaskOutcome::failed(format!("executor panicked: {}", message))
            }
        }
    }

    async fn record_completion(&mut self, shutdown: &CancellationToken) {
        if self.session.is_none() {
            return;
        }
        self.completions_since_restart += 1;

        if let Some(threshold) = self.recycle_after
            && self.completions_since_restart >= threshold
        {
            tracing::info!(
                completions = self.completions_since_restart,
                "Recycling session"
            );
            if let Some(session) = self.session.take() {
                self.discard(session).await;
            }
            if !shutdown.is_cancelled() {
                self.replace_session().await;
            }
        }
    }

    async fn discard(&mut self, session: Box<dyn Session>) {
        session.close().await;
        self.completions_since_restart = 0;
        self.stats.session_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Bring up a session ahead of the next task. Failure is logged and
    /// retried when a task needs it.
    async fn replace_session(&mut self) {
        match self.create_session().await {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create session, will retry on next task")
            }
        }
    }

    async fn create_session(&mut self) -> Result<Box<dyn Session>, SessionError> {
        let session = self.factory.create(&self.options).await?;
        self.completions_since_restart = 0;
        tracing::debug!("Session created");
        Ok(session)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
