//! End-to-end tests: a real server on a temporary socket, driven by the client.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;

use drudge::{
    Client, Credential, EngineConfig, EngineState, ExecuteError, Lookup, Server, ServerConfig,
    ServerError, Session, SessionError, SessionFactory, SessionOptions, SubmitOutcome, Task,
    TaskId, TaskOutcome,
};

/// Echoes the activity back. Creation optionally waits on a gate so tests can
/// hold the worker before it dequeues anything.
#[derive(Default)]
struct EchoFactory {
    create_gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl SessionFactory for EchoFactory {
    async fn create(&self, _options: &SessionOptions) -> Result<Box<dyn Session>, SessionError> {
        if let Some(gate) = &self.create_gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(Box::new(EchoSession))
    }
}

struct EchoSession;

#[async_trait]
impl Session for EchoSession {
    async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecuteError> {
        if let Some(msg) = task.activity.get("fail").and_then(|v| v.as_str()) {
            return Err(ExecuteError::activity(msg));
        }
        Ok(json!({"echo": task.activity}))
    }

    async fn close(self: Box<Self>) {}
}

struct Running {
    path: PathBuf,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    fn client(&self) -> Client {
        Client::new(&self.path).with_timeout(Duration::from_secs(5))
    }

    async fn stop(self) -> Result<(), ServerError> {
        let _ = self.stop.send(());
        self.handle.await.unwrap()
    }
}

async fn start(path: &Path, engine: EngineConfig, factory: EchoFactory) -> Running {
    let config = ServerConfig::new(path).with_engine(engine);
    let server = Server::bind(config, Arc::new(factory)).await.unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));
    Running {
        path: path.to_path_buf(),
        stop,
        handle,
    }
}

async fn submit(client: &Client, activity: serde_json::Value) -> SubmitOutcome {
    client
        .submit(activity, Credential::new("token"), Duration::ZERO)
        .await
        .unwrap()
}

fn accepted(outcome: SubmitOutcome) -> TaskId {
    match outcome {
        SubmitOutcome::Accepted(id) => id,
        SubmitOutcome::QueueFull => panic!("unexpected queue_full"),
    }
}

#[tokio::test]
async fn submit_then_poll_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(
        &dir.path().join("drudge.sock"),
        EngineConfig::new(),
        EchoFactory::default(),
    )
    .await;
    let client = server.client();

    let id = accepted(submit(&client, json!({"script": "export"})).await);
    let outcome = client
        .wait_for(id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::succeeded(json!({"echo": {"script": "export"}}))
    );

    // Results stay readable until they expire.
    assert_eq!(client.poll(id).await.unwrap(), Lookup::Completed(outcome));

    let failed = accepted(submit(&client, json!({"fail": "no such window"})).await);
    let outcome = client
        .wait_for(failed, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::failed("no such window"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(
        &dir.path().join("drudge.sock"),
        EngineConfig::new(),
        EchoFactory::default(),
    )
    .await;

    let client = server.client();
    assert_eq!(client.poll(TaskId::new()).await.unwrap(), Lookup::NotFound);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn queue_size_two_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let server = start(
        &dir.path().join("drudge.sock"),
        EngineConfig::new().with_queue_size(2),
        EchoFactory {
            create_gate: Some(Arc::clone(&gate)),
        },
    )
    .await;
    let client = server.client();

    let t1 = accepted(submit(&client, json!("t1")).await);
    let t2 = accepted(submit(&client, json!("t2")).await);
    assert_eq!(submit(&client, json!("t3")).await, SubmitOutcome::QueueFull);
    assert_eq!(client.poll(t1).await.unwrap(), Lookup::NotCompleted);
    assert_eq!(client.poll(t2).await.unwrap(), Lookup::NotCompleted);

    gate.add_permits(1);
    let outcome = client
        .wait_for(t1, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::succeeded(json!({"echo": "t1"})));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn second_server_fails_and_first_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drudge.sock");
    let first = start(&path, EngineConfig::new(), EchoFactory::default()).await;

    let second = Server::bind(ServerConfig::new(&path), Arc::new(EchoFactory::default())).await;
    match second {
        Err(ServerError::EndpointExists(p)) => assert_eq!(p, path),
        Err(other) => panic!("expected EndpointExists, got {:?}", other),
        Ok(_) => panic!("second server bound an endpoint in use"),
    }

    assert!(path.exists());
    let client = first.client();
    let id = accepted(submit(&client, json!("still here")).await);
    client
        .wait_for(id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();

    first.stop().await.unwrap();
}

#[tokio::test]
async fn garbage_does_not_kill_server() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(
        &dir.path().join("drudge.sock"),
        EngineConfig::new(),
        EchoFactory::default(),
    )
    .await;

    // A well-framed body that is not a request.
    let mut stream = UnixStream::connect(&server.path).await.unwrap();
    stream.write_all(&[0, 0, 0, 5]).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    drop(stream);

    // A length prefix far past the frame limit.
    let mut stream = UnixStream::connect(&server.path).await.unwrap();
    stream.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
    drop(stream);

    // Connect and hang up without a request.
    drop(UnixStream::connect(&server.path).await.unwrap());

    let status = server.client().status().await.unwrap();
    assert_eq!(status.state, EngineState::Running);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn status_reports_engine() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(
        &dir.path().join("drudge.sock"),
        EngineConfig::new().with_queue_size(7),
        EchoFactory::default(),
    )
    .await;
    let client = server.client();

    let id = accepted(submit(&client, json!(1)).await);
    client
        .wait_for(id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.queue_capacity, Some(7));
    assert_eq!(status.completed_total, 1);
    assert_eq!(status.cached_results, 1);
    assert_eq!(status.version.protocol, drudge::PROTOCOL_VERSION);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn results_expire_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(
        &dir.path().join("drudge.sock"),
        EngineConfig::new().with_result_ttl(Duration::from_millis(300)),
        EchoFactory::default(),
    )
    .await;
    let client = server.client();

    let id = accepted(submit(&client, json!("short-lived")).await);
    client
        .wait_for(id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.poll(id).await.unwrap(), Lookup::NotFound);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_shutdown_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drudge.sock");
    let server = start(&path, EngineConfig::new(), EchoFactory::default()).await;

    server.client().shutdown().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("server did not exit")
        .unwrap();
    assert!(result.is_ok());

    assert!(!path.exists());
    assert!(dir.path().join("drudge.sock.stop.lock").exists());

    // The path is free again.
    let again = start(&path, EngineConfig::new(), EchoFactory::default()).await;
    again.stop().await.unwrap();
}

#[tokio::test]
async fn signal_teardown_removes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("drudge.sock");
    let server = start(&path, EngineConfig::new(), EchoFactory::default()).await;
    assert!(path.exists());

    server.stop().await.unwrap();
    assert!(!path.exists());
    assert!(
        Client::new(&path)
            .status()
            .await
            .is_err(),
        "server still answering after teardown"
    );
}
