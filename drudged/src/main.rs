//! drudged: serve a drudge job queue on a Unix socket, or talk to one.
//!
//! `drudged serve` runs the daemon. The other subcommands are thin clients
//! that print the server's answer as JSON on stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use drudge::{
    Client, Credential, EngineConfig, Lookup, ProcessSessionFactory, ServerConfig, SubmitOutcome,
    TaskId,
};

#[derive(Parser, Debug)]
#[command(name = "drudged", version)]
#[command(about = "Bounded single-worker job queue over a Unix socket")]
struct Cli {
    /// Path of the server socket
    #[arg(
        long,
        global = true,
        env = "DRUDGE_SOCKET",
        default_value = "/tmp/drudge/drudge.sock"
    )]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until SIGINT, SIGTERM or a stop request
    Serve(ServeArgs),

    /// Queue an activity and print its task id
    Submit(SubmitArgs),

    /// Print the result of a task, if it is ready
    Poll {
        /// Task id returned by submit
        id: String,
    },

    /// Print the server's status snapshot
    Status,

    /// Ask the server to shut down
    Stop,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Task queue capacity (0 = unbounded)
    #[arg(long, env = "DRUDGE_QUEUE_SIZE", default_value_t = 16)]
    queue_size: usize,

    /// Seconds the executor may spend reading an artifact (5-60)
    #[arg(long, env = "DRUDGE_READ_FILE_TIMEOUT", default_value_t = 30)]
    read_file_timeout: u64,

    /// Ask sessions to run under a virtual display
    #[arg(long, env = "DRUDGE_USE_VIRTUAL_DISPLAY")]
    use_virtual_display: bool,

    /// Seconds a finished result stays retrievable
    #[arg(long, env = "DRUDGE_RESULT_TTL", default_value_t = 300)]
    result_ttl: u64,

    /// Recreate the session after this many tasks (0 = never)
    #[arg(long, env = "DRUDGE_TASKS_BEFORE_SESSION_RESTART", default_value_t = 50)]
    tasks_before_session_restart: u32,

    /// Listen backlog
    #[arg(long, env = "DRUDGE_MAX_CONNECTIONS", default_value_t = 128)]
    max_connections: u32,

    /// Seconds allowed for one request/response exchange
    #[arg(long, env = "DRUDGE_CONNECTION_TIMEOUT", default_value_t = 30)]
    connection_timeout: u64,

    /// Program that implements the session protocol on stdin/stdout
    #[arg(long, env = "DRUDGE_SESSION_COMMAND")]
    session_command: PathBuf,

    /// Arguments passed to the session program
    #[arg(last = true)]
    session_args: Vec<String>,
}

impl ServeArgs {
    fn server_config(&self, socket: PathBuf) -> ServerConfig {
        let engine = EngineConfig::new()
            .with_queue_size(self.queue_size)
            .with_read_file_timeout(Duration::from_secs(self.read_file_timeout))
            .with_virtual_display(self.use_virtual_display)
            .with_result_ttl(Duration::from_secs(self.result_ttl))
            .with_tasks_before_session_restart(self.tasks_before_session_restart);
        ServerConfig::new(socket)
            .with_max_connections(self.max_connections)
            .with_connection_timeout(Duration::from_secs(self.connection_timeout))
            .with_engine(engine)
    }
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Activity payload as JSON
    activity: String,

    /// Credential handed to the executor
    #[arg(long, env = "DRUDGE_CREDENTIAL", hide_env_values = true)]
    credential: String,

    /// Milliseconds the executor waits for the target to settle
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Wait for the result and print it instead of the task id
    #[arg(long)]
    wait: bool,

    /// Seconds to wait with --wait
    #[arg(long, default_value_t = 300)]
    wait_timeout: u64,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("DRUDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("drudge={level},drudged={level}", level = base_level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("drudged failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new(&cli.socket);
    match cli.command {
        Command::Serve(args) => serve(cli.socket, args).await,
        Command::Submit(args) => submit(&client, args).await,
        Command::Poll { id } => {
            let id = TaskId::parse(&id).with_context(|| format!("invalid task id {:?}", id))?;
            let lookup = client.poll(id).await.context("poll failed")?;
            print_json(&lookup_json(id, lookup))
        }
        Command::Status => {
            let status = client.status().await.context("status failed")?;
            if !drudge::VersionInfo::new().is_compatible(&status.version) {
                tracing::warn!(
                    server_protocol = status.version.protocol,
                    client_protocol = drudge::PROTOCOL_VERSION,
                    "Server speaks a different protocol revision"
                );
            }
            print_json(&status)
        }
        Command::Stop => {
            client.shutdown().await.context("stop failed")?;
            print_json(&json!({"status": "shutting_down"}))
        }
    }
}

async fn serve(socket: PathBuf, args: ServeArgs) -> Result<()> {
    let config = args.server_config(socket);
    let factory = ProcessSessionFactory::new(&args.session_command).with_args(args.session_args);

    tracing::info!(
        version = drudge::DRUDGE_VERSION,
        session_command = %args.session_command.display(),
        "Starting drudged"
    );
    drudge::serve(config, Arc::new(factory))
        .await
        .context("server failed")
}

async fn submit(client: &Client, args: SubmitArgs) -> Result<()> {
    let activity: serde_json::Value =
        serde_json::from_str(&args.activity).context("activity must be valid JSON")?;
    client
        .ensure_compatible()
        .await
        .context("server check failed")?;
    let outcome = client
        .submit(
            activity,
            Credential::new(args.credential),
            Duration::from_millis(args.delay_ms),
        )
        .await
        .context("submit failed")?;

    let id = match outcome {
        SubmitOutcome::Accepted(id) => id,
        SubmitOutcome::QueueFull => anyhow::bail!("queue is full, retry later"),
    };
    if !args.wait {
        return print_json(&json!({"id": id}));
    }

    let outcome = client
        .wait_for(
            id,
            Duration::from_millis(250),
            Duration::from_secs(args.wait_timeout),
        )
        .await
        .with_context(|| format!("waiting for task {} failed", id))?;
    print_json(&json!({"id": id, "outcome": outcome}))
}

fn lookup_json(id: TaskId, lookup: Lookup) -> serde_json::Value {
    match lookup {
        Lookup::Completed(outcome) => json!({"id": id, "state": "completed", "outcome": outcome}),
        Lookup::NotCompleted => json!({"id": id, "state": "not_completed"}),
        Lookup::NotFound => json!({"id": id, "state": "not_found"}),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{}", rendered);
    Ok(())
}
