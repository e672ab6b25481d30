//! Request handlers: one request in, one response out.

use std::time::Duration;

use tokio::sync::watch;

use crate::bridge::protocol::{Request, Response};
use crate::engine::{Engine, Lookup, SubmitError};

/// Map a decoded request onto the engine. Never blocks on the worker.
pub(crate) fn dispatch(
    engine: &Engine,
    request: Request,
    shutdown: &watch::Sender<bool>,
) -> Response {
    match request {
        Request::Submit {
            activity,
            credential,
            stabilization_delay_ms,
        } => {
            let delay = Duration::from_millis(stabilization_delay_ms);
            match engine.put(activity, credential, delay) {
                Ok(id) => {
                    tracing::debug!(task_id = %id, "Submit accepted");
                    Response::Accepted { id }
                }
                Err(SubmitError::QueueFull { capacity }) => {
                    tracing::debug!(capacity, "Submit rejected, queue full");
                    Response::QueueFull
                }
                Err(e @ SubmitError::NotRunning { .. }) => {
                    tracing::warn!(error = %e, "Submit rejected");
                    Response::Rejected {
                        reason: e.to_string(),
                    }
                }
            }
        }

        Request::Poll { id } => match engine.get(id) {
            Lookup::Completed(outcome) => {
                tracing::debug!(task_id = %id, success = outcome.is_success(), "Poll completed");
                Response::Completed { outcome }
            }
            Lookup::NotCompleted => {
                tracing::debug!(task_id = %id, "Poll not completed");
                Response::NotCompleted
            }
            Lookup::NotFound => {
                tracing::debug!(task_id = %id, "Poll not found");
                Response::NotFound
            }
        },

        Request::Status => {
            let status = engine.status();
            tracing::debug!(state = %status.state, queue_len = status.queue_len, "Status");
            Response::Status { status }
        }

        Request::Shutdown => {
            tracing::info!("Shutdown requested by client");
            shutdown.send_replace(true);
            Response::ShuttingDown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineState;
    use crate::session::testing::ScriptedFactory;
    use crate::task::{Credential, TaskId};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn submit(activity: serde_json::Value) -> Request {
        Request::Submit {
            activity,
            credential: Credential::new("c"),
            stabilization_delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn submit_and_queue_full() {
        let gate = Arc::new(Semaphore::new(0));
        let factory = ScriptedFactory::new().with_create_gate(gate);
        let engine =
            Engine::new(EngineConfig::new().with_queue_size(1), Arc::new(factory)).unwrap();
        engine.start().unwrap();
        let (tx, _rx) = watch::channel(false);

        let id = match dispatch(&engine, submit(json!(1)), &tx) {
            Response::Accepted { id } => id,
            other => panic!("expected accepted, got {:?}", other),
        };
        assert!(matches!(
            dispatch(&engine, submit(json!(2)), &tx),
            Response::QueueFull
        ));
        assert!(matches!(
            dispatch(&engine, Request::Poll { id }, &tx),
            Response::NotCompleted
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn submit_to_stopped_engine_is_rejected() {
        let engine = Engine::new(EngineConfig::new(), Arc::new(ScriptedFactory::new())).unwrap();
        let (tx, _rx) = watch::channel(false);

        match dispatch(&engine, submit(json!(1)), &tx) {
            Response::Rejected { reason } => {
                assert_eq!(reason, "engine is stopped, not accepting tasks")
            }
            other => panic!("expected rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn poll_unknown_is_not_found() {
        let engine = Engine::new(EngineConfig::new(), Arc::new(ScriptedFactory::new())).unwrap();
        engine.start().unwrap();
        let (tx, _rx) = watch::channel(false);

        assert!(matches!(
            dispatch(&engine, Request::Poll { id: TaskId::new() }, &tx),
            Response::NotFound
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn status_and_shutdown() {
        let engine = Engine::new(EngineConfig::new(), Arc::new(ScriptedFactory::new())).unwrap();
        engine.start().unwrap();
        let (tx, rx) = watch::channel(false);

        match dispatch(&engine, Request::Status, &tx) {
            Response::Status { status } => assert_eq!(status.state, EngineState::Running),
            other => panic!("expected status, got {:?}", other),
        }

        assert!(!*rx.borrow());
        assert!(matches!(
            dispatch(&engine, Request::Shutdown, &tx),
            Response::ShuttingDown
        ));
        assert!(*rx.borrow());
        engine.stop().await;
    }
}
