#![forbid(unsafe_code)]

//! `toolpipe`: command-line client for JSON-RPC tool servers.
//!
//! Spawns the server named in the configuration, performs the handshake,
//! runs one command, prints its JSON result to stdout, and stops the server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use toolpipe::client::{Client, ClientEvent};
use toolpipe::config::ClientConfig;
use toolpipe::{AppError, Result};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 64;

/// How long to wait for remaining events to be logged after stopping.
const EVENT_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "toolpipe", about = "JSON-RPC client for stdio tool servers", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the tools the server exposes.
    ListTools,

    /// Invoke one tool.
    Call {
        /// Tool name.
        name: String,

        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Check that the server answers.
    Ping,

    /// Send an arbitrary request or notification.
    Raw {
        /// JSON-RPC method name.
        method: String,

        /// Parameters as JSON.
        #[arg(long, default_value = "{}")]
        params: String,

        /// Send as a notification and do not wait for a response.
        #[arg(long)]
        notify: bool,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = ClientConfig::load_from_path(&args.config)?;
    info!(command = %config.server.command, "configuration loaded");

    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let events = tokio::spawn(log_events(event_rx));

    let client = Client::new(config, event_tx)?;

    let outcome = tokio::select! {
        result = execute(&client, args.command) => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Err(AppError::Stopped("interrupted by signal".into()))
        }
    };

    client.stop().await?;
    drop(client);
    // The reader task holds the last sender until it observes cancellation.
    let _ = tokio::time::timeout(EVENT_FLUSH, events).await;

    let value = outcome?;
    if !value.is_null() {
        let rendered = serde_json::to_string_pretty(&value)?;
        println!("{rendered}");
    }
    Ok(())
}

async fn execute(client: &Client, command: Command) -> Result<Value> {
    let server = client.start().await?;
    info!(server = server.name(), "connected");

    match command {
        Command::ListTools => {
            let tools = client.list_tools().await?;
            Ok(serde_json::to_value(tools)?)
        }
        Command::Call { name, args } => {
            let arguments = parse_json("--args", &args)?;
            let result = client.call_tool(&name, arguments).await?;
            if result.is_error {
                warn!(tool = %name, "tool reported an error");
            }
            Ok(serde_json::to_value(result)?)
        }
        Command::Ping => {
            client.ping().await?;
            Ok(serde_json::json!({ "ok": true }))
        }
        Command::Raw {
            method,
            params,
            notify,
        } => {
            let params = parse_json("--params", &params)?;
            if notify {
                client.notify(&method, params).await?;
                Ok(Value::Null)
            } else {
                client.request(&method, params).await
            }
        }
    }
}

fn parse_json(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| AppError::Config(format!("{flag} is not valid JSON: {err}")))
}

/// Log lifecycle events until every client handle is gone.
async fn log_events(mut events: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Started { pid } => info!(?pid, "server started"),
            ClientEvent::HandshakeComplete { server } => {
                debug!(server = server.name(), "handshake complete");
            }
            ClientEvent::Notification { method, .. } => debug!(%method, "server notification"),
            ClientEvent::ServerRequest { method, id, .. } => {
                warn!(%method, %id, "server request left unanswered");
            }
            ClientEvent::FrameDropped { reason } => warn!(%reason, "frame dropped"),
            ClientEvent::ProcessExited { code, signal } => {
                warn!(?code, ?signal, "server process exited");
            }
            ClientEvent::Error { message } => warn!(%message, "client error"),
            ClientEvent::Stopped { reason } => info!(%reason, "client stopped"),
            ClientEvent::ToolCalled {
                name,
                duration,
                is_error,
            } => debug!(%name, ?duration, is_error, "tool called"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command results only.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
