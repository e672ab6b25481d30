//! Client for a running drudge server.
//!
//! Every call opens a fresh connection, sends one request and reads one
//! response, mirroring the server's connection model.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Request, Response};
use crate::engine::{EngineStatus, Lookup};
use crate::task::{Credential, TaskId, TaskOutcome};
use crate::version::VersionInfo;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {}: {source}", .path.display())]
    Connect { path: PathBuf, source: io::Error },

    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("server closed the connection without responding")]
    Closed,

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("task {0} is unknown or its result expired")]
    NotFound(TaskId),

    #[error("task {id} still not completed after {waited:?}")]
    Deadline { id: TaskId, waited: Duration },

    #[error("server speaks protocol {server}, this client speaks {client}")]
    Incompatible { server: u32, client: u32 },
}

/// Result of a submission the server answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(TaskId),
    QueueFull,
}

#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Client {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound on one request/response exchange, connect included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn submit(
        &self,
        activity: serde_json::Value,
        credential: Credential,
        stabilization_delay: Duration,
    ) -> Result<SubmitOutcome, ClientError> {
        let request = Request::Submit {
            activity,
            credential,
            stabilization_delay_ms: u64::try_from(stabilization_delay.as_millis())
                .unwrap_or(u64::MAX),
        };
        match self.request(request).await? {
            Response::Accepted { id } => Ok(SubmitOutcome::Accepted(id)),
            Response::QueueFull => Ok(SubmitOutcome::QueueFull),
            other => Err(unexpected(other)),
        }
    }

    pub async fn poll(&self, id: TaskId) -> Result<Lookup, ClientError> {
        match self.request(Request::Poll { id }).await? {
            Response::Completed { outcome } => Ok(Lookup::Completed(outcome)),
            Response::NotCompleted => Ok(Lookup::NotCompleted),
            Response::NotFound => Ok(Lookup::NotFound),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<EngineStatus, ClientError> {
        match self.request(Request::Status).await? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the server's status, failing if its protocol revision differs
    /// from ours.
    pub async fn ensure_compatible(&self) -> Result<EngineStatus, ClientError> {
        let status = self.status().await?;
        let ours = VersionInfo::new();
        if !ours.is_compatible(&status.version) {
            return Err(ClientError::Incompatible {
                server: status.version.protocol,
                client: ours.protocol,
            });
        }
        Ok(status)
    }

    /// Ask the server to tear down and exit.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        match self.request(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Poll every `interval` until the task completes or `deadline` passes.
    pub async fn wait_for(
        &self,
        id: TaskId,
        interval: Duration,
        deadline: Duration,
    ) -> Result<TaskOutcome, ClientError> {
        let started = Instant::now();
        loop {
            match self.poll(id).await? {
                Lookup::Completed(outcome) => return Ok(outcome),
                Lookup::NotFound => return Err(ClientError::NotFound(id)),
                Lookup::NotCompleted => {}
            }
            let waited = started.elapsed();
            if waited >= deadline {
                return Err(ClientError::Deadline { id, waited });
            }
            tokio::time::sleep(interval.min(deadline - waited)).await;
        }
    }

    async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let response = tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        match response {
            Response::Rejected { reason } => Err(ClientError::Rejected(reason)),
            other => Ok(other),
        }
    }

    async fn exchange(&self, request: Request) -> Result<Response, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = FramedWrite::new(write_half, JsonCodec::<Request>::new());
        let mut reader = FramedRead::new(read_half, JsonCodec::<Response>::new());

        writer.send(request).await?;
        match reader.next().await {
            Some(response) => Ok(response?),
            None => Err(ClientError::Closed),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Unexpected(format!("{:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// Accept one connection and answer it with `response`.
    fn one_shot_server(
        listener: UnixListener,
        response: Response,
    ) -> tokio::task::JoinHandle<Request> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let request = FramedRead::new(r, JsonCodec::<Request>::new())
                .next()
                .await
                .unwrap()
                .unwrap();
            FramedWrite::new(w, JsonCodec::<Response>::new())
                .send(response)
                .await
                .unwrap();
            request
        })
    }

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(dir.path().join("absent.sock"));
        let err = client.status().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn submit_maps_queue_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let server = one_shot_server(UnixListener::bind(&path).unwrap(), Response::QueueFull);

        let outcome = Client::new(&path)
            .submit(serde_json::json!("x"), Credential::new("c"), Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::QueueFull);

        match server.await.unwrap() {
            Request::Submit {
                stabilization_delay_ms,
                ..
            } => assert_eq!(stabilization_delay_ms, 1500),
            other => panic!("expected submit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejected_becomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _server = one_shot_server(
            UnixListener::bind(&path).unwrap(),
            Response::Rejected {
                reason: "engine is stopping, not accepting tasks".into(),
            },
        );

        let err = Client::new(&path)
            .submit(serde_json::json!("x"), Credential::new("c"), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
    }

    #[tokio::test]
    async fn mismatched_response_is_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _server = one_shot_server(UnixListener::bind(&path).unwrap(), Response::NotFound);

        let err = Client::new(&path).status().await.unwrap_err();
        assert!(matches!(err, ClientError::Unexpected(_)));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let err = Client::new(&path)
            .with_timeout(Duration::from_millis(100))
            .status()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    fn status_with_protocol(protocol: u32) -> Response {
        Response::Status {
            status: EngineStatus {
                state: crate::engine::EngineState::Running,
                queue_len: 0,
                queue_capacity: None,
                in_flight: None,
                cached_results: 0,
                completed_total: 0,
                session_restarts: 0,
                version: VersionInfo {
                    drudge: "0.1.0".into(),
                    protocol,
                },
            },
        }
    }

    #[tokio::test]
    async fn matching_protocol_is_compatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _server = one_shot_server(
            UnixListener::bind(&path).unwrap(),
            status_with_protocol(crate::version::PROTOCOL_VERSION),
        );

        let status = Client::new(&path).ensure_compatible().await.unwrap();
        assert_eq!(status.version.drudge, "0.1.0");
    }

    #[tokio::test]
    async fn other_protocol_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _server = one_shot_server(
            UnixListener::bind(&path).unwrap(),
            status_with_protocol(crate::version::PROTOCOL_VERSION + 1),
        );

        match Client::new(&path).ensure_compatible().await.unwrap_err() {
            ClientError::Incompatible { server, client } => {
                assert_eq!(server, crate::version::PROTOCOL_VERSION + 1);
                assert_eq!(client, crate::version::PROTOCOL_VERSION);
            }
            other => panic!("expected Incompatible, got {:?}", other),
        }
    }
}
