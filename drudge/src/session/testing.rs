//! Scripted session double for unit tests.
//!
//! The activity payload drives behaviour:
//! - `{"fail": msg}`: activity error
//! - `{"lose": msg}`: session lost
//! - `{"panic": msg}`: the executor panics
//! - anything else: succeeds with `{"echo": activity, "session": n}`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use super::{ExecuteError, Session, SessionError, SessionFactory, SessionOptions};
use crate::task::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Created(usize),
    Executed { session: usize, task: TaskId },
    Closed(usize),
}

#[derive(Default)]
pub(crate) struct ScriptedFactory {
    events: Arc<Mutex<Vec<Event>>>,
    sessions: AtomicUsize,
    failing_creates: AtomicUsize,
    create_gate: Option<Arc<Semaphore>>,
    execute_gate: Option<Arc<Semaphore>>,
}

impl ScriptedFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every `create` waits for a permit on `gate`.
    pub(crate) fn with_create_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.create_gate = Some(gate);
        self
    }

    /// Every `execute` waits for a permit on `gate`.
    pub(crate) fn with_execute_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.execute_gate = Some(gate);
        self
    }

    /// The next `n` creations fail.
    pub(crate) fn with_failing_creates(self, n: usize) -> Self {
        self.failing_creates.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(&self, _options: &SessionOptions) -> Result<Box<dyn Session>, SessionError> {
        if let Some(gate) = &self.create_gate {
            gate.acquire().await.unwrap().forget();
        }
        if self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SessionError::Start("scripted failure".into()));
        }

        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().unwrap().push(Event::Created(n));
        Ok(Box::new(ScriptedSession {
            n,
            events: Arc::clone(&self.events),
            execute_gate: self.execute_gate.clone(),
        }))
    }
}

struct ScriptedSession {
    n: usize,
    events: Arc<Mutex<Vec<Event>>>,
    execute_gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecuteError> {
        if let Some(gate) = &self.execute_gate {
            gate.acquire().await.unwrap().forget();
        }
        self.events.lock().unwrap().push(Event::Executed {
            session: self.n,
            task: task.id,
        });

        let activity = &task.activity;
        if let Some(msg) = activity.get("fail").and_then(|v| v.as_str()) {
            return Err(ExecuteError::activity(msg));
        }
        if let Some(msg) = activity.get("lose").and_then(|v| v.as_str()) {
            return Err(ExecuteError::session_lost(msg));
        }
        if let Some(msg) = activity.get("panic").and_then(|v| v.as_str()) {
            panic!("{}", msg);
        }
        Ok(json!({"echo": activity, "session": self.n}))
    }

    async fn close(self: Box<Self>) {
        self.events.lock().unwrap().push(Event::Closed(self.n));
    }
}
