//! Subprocess-backed sessions.
//!
//! The session command is spawned with piped stdin/stdout and speaks the same
//! length-delimited JSON codec as the client socket:
//!
//! ```text
//! worker                          session process
//!   |-- init {timeouts, display} --->|
//!   |<------------- ready -----------|
//!   |-- execute {id, activity, ..} ->|
//!   |<---- done {id, value} ---------|   or failed {id, error}
//!   |-- shutdown ------------------->|
//! ```
//!
//! stderr is inherited so the session's own logs land next to the daemon's.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{ExecuteError, Session, SessionError, SessionFactory, SessionOptions};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{SessionRequest, SessionResponse};
use crate::task::Task;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spawns one session process per [`create`](SessionFactory::create).
#[derive(Debug, Clone)]
pub struct ProcessSessionFactory {
    program: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
    shutdown_grace: Duration,
}

impl ProcessSessionFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// How long a freshly spawned process has to answer `init` with `ready`.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// How long `close` waits after each shutdown step before escalating.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl SessionFactory for ProcessSessionFactory {
    async fn create(&self, options: &SessionOptions) -> Result<Box<dyn Session>, SessionError> {
        let mut child = self.command().spawn().map_err(|e| {
            SessionError::Start(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Start("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Start("stdout not captured".to_string()))?;

        let mut channel = SessionChannel::new(stdout, stdin);

        tracing::debug!(pid = ?child.id(), "Waiting for session to become ready");
        let ready = tokio::time::timeout(self.ready_timeout, channel.handshake(options)).await;
        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(SessionError::ReadyTimeout(self.ready_timeout)),
        };
        if let Some(e) = failure {
            if let Err(kill_err) = child.kill().await {
                tracing::debug!(error = %kill_err, "Failed to kill unready session");
            }
            return Err(e);
        }

        tracing::info!(pid = ?child.id(), program = %self.program.display(), "Session ready");
        Ok(Box::new(ProcessSession {
            child,
            channel,
            shutdown_grace: self.shutdown_grace,
        }))
    }
}

/// Request/response framing over a session's pipes.
pub(crate) struct SessionChannel<R, W> {
    reader: FramedRead<R, JsonCodec<SessionResponse>>,
    writer: FramedWrite<W, JsonCodec<SessionRequest>>,
}

impl<R, W> SessionChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, JsonCodec::new()),
            writer: FramedWrite::new(writer, JsonCodec::new()),
        }
    }

    /// Send `init` and wait for `ready`.
    pub(crate) async fn handshake(&mut self, options: &SessionOptions) -> Result<(), SessionError> {
        self.writer
            .send(SessionRequest::Init {
                read_file_timeout_secs: options.read_file_timeout.as_secs(),
                use_virtual_display: options.use_virtual_display,
            })
            .await?;

        match self.reader.next().await {
            Some(Ok(SessionResponse::Ready)) => Ok(()),
            Some(Ok(other)) => Err(SessionError::Protocol(format!(
                "expected ready, got {:?}",
                other
            ))),
            Some(Err(e)) => Err(SessionError::Protocol(format!(
                "invalid handshake frame: {}",
                e
            ))),
            None => Err(SessionError::Start(
                "session exited before becoming ready".to_string(),
            )),
        }
    }

    /// Run one task and wait for its answer.
    ///
    /// Answers carrying another task's id are stale and skipped. A closed or
    /// corrupt pipe means the session is lost.
    pub(crate) async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecuteError> {
        let stabilization_delay_ms =
            u64::try_from(task.stabilization_delay.as_millis()).unwrap_or(u64::MAX);
        self.writer
            .send(SessionRequest::Execute {
                id: task.id,
                activity: task.activity.clone(),
                credential: task.credential.clone(),
                stabilization_delay_ms,
            })
            .await
            .map_err(|e| ExecuteError::session_lost(format!("failed to send task: {}", e)))?;

        loop {
            match self.reader.next().await {
                Some(Ok(SessionResponse::Done { id, value })) if id == task.id => return Ok(value),
                Some(Ok(SessionResponse::Failed { id, error })) if id == task.id => {
                    return Err(ExecuteError::Activity(error));
                }
                Some(Ok(other)) => {
                    tracing::warn!(
                        task_id = %task.id,
                        ?other,
                        "Ignoring unexpected session message"
                    );
                }
                Some(Err(e)) => {
                    return Err(ExecuteError::session_lost(format!(
                        "invalid frame from session: {}",
                        e
                    )));
                }
                None => return Err(ExecuteError::session_lost("session closed its output")),
            }
        }
    }

    pub(crate) async fn send_shutdown(&mut self) -> std::io::Result<()> {
        self.writer.send(SessionRequest::Shutdown).await
    }
}

struct ProcessSession {
    child: Child,
    channel: SessionChannel<ChildStdout, ChildStdin>,
    shutdown_grace: Duration,
}

impl ProcessSession {
    async fn wait_exit(&mut self) -> bool {
        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "Session exited");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed waiting for session");
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Session for ProcessSession {
    async fn execute(&mut self, task: &Task) -> Result<serde_json::Value, ExecuteError> {
        self.channel.execute(task).await
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.channel.send_shutdown().await {
            tracing::debug!(error = %e, "Could not send shutdown to session");
        }
        if self.wait_exit().await {
            return;
        }

        if let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) {
            tracing::info!(pid, "Session ignored shutdown, sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
            }
            if self.wait_exit().await {
                return;
            }
        }

        tracing::warn!("Session did not exit, killing");
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill session");
        }
    }
}
