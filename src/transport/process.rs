//! Child process transport.
//!
//! Spawns the server process with piped stdio and owns its lifecycle:
//! - stdin is wrapped in a [`FramedWrite`] behind an async mutex, so frames
//!   from concurrent callers never interleave. `None` in that slot means
//!   the transport is no longer connected.
//! - stdout is handed back to the caller for the reader loop.
//! - stderr is drained line by line into `tracing` and never parsed.
//! - an exit monitor task owns the [`Child`], reports its exit status as a
//!   [`TransportEvent`], and performs the graceful stop sequence on request.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::rpc::codec::FrameCodec;
use crate::rpc::message::OutboundMessage;
use crate::transport::TransportEvent;
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the child when `isolate_env` is set.
///
/// Every other variable is stripped via `env_clear()`; values from
/// `server.env` are applied afterwards.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "RUST_LOG",
    "TMPDIR",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Logging target for lines the child writes to stderr.
pub const STDERR_TARGET: &str = "toolpipe::server_stderr";

/// Write half of the child's stdin.
type StdinWriter = FramedWrite<ChildStdin, FrameCodec>;

/// Result of a successful [`ProcessTransport::start`].
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Handle used to write frames and stop the process.
    pub transport: ProcessTransport,
    /// The child's stdout, for the reader loop.
    pub stdout: ChildStdout,
}

/// Stop signal plus the monitor task that acts on it.
#[derive(Debug)]
struct Shutdown {
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

/// Running child process with framed write access to its stdin.
#[derive(Debug)]
pub struct ProcessTransport {
    pid: Option<u32>,
    writer: Arc<Mutex<Option<StdinWriter>>>,
    shutdown: Mutex<Option<Shutdown>>,
}

impl ProcessTransport {
    /// Spawn the configured process.
    ///
    /// Sends [`TransportEvent::Started`] on success. The exit monitor later
    /// sends [`TransportEvent::Exited`] or [`TransportEvent::ErrorOccurred`]
    /// if the process ends on its own; a requested stop emits nothing.
    ///
    /// # Errors
    ///
    /// - `AppError::Spawn("failed to spawn …")` when the OS refuses to launch it.
    /// - `AppError::Spawn("failed to capture …")` when a stdio pipe is missing.
    pub fn start(
        config: &ServerConfig,
        shutdown_grace: Duration,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if config.isolate_env {
            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
        }
        cmd.envs(&config.env);

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to spawn '{}': {err}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture child stdout".into()))?;
        let stderr = child.stderr.take();

        let pid = child.id();
        info!(?pid, command = %config.command, "server process spawned");

        if let Some(stderr) = stderr {
            spawn_stderr_sink(stderr, pid);
        }

        let writer = Arc::new(Mutex::new(Some(FramedWrite::new(stdin, FrameCodec::new()))));
        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_exit(
            child,
            Arc::clone(&writer),
            stop_rx,
            shutdown_grace,
            event_tx.clone(),
        ));

        if event_tx.try_send(TransportEvent::Started { pid }).is_err() {
            debug!(?pid, "transport event channel unavailable for Started");
        }

        Ok(SpawnedProcess {
            transport: Self {
                pid,
                writer,
                shutdown: Mutex::new(Some(Shutdown { stop_tx, monitor })),
            },
            stdout,
        })
    }

    /// OS process id captured at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether frames can still be written.
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Write one frame to the child's stdin and flush it.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotConnected`] after [`ProcessTransport::stop`] or once
    ///   the process has exited.
    /// - [`AppError::BrokenPipe`] when the write fails; the transport is
    ///   marked disconnected.
    /// - [`AppError::Protocol`] if the message cannot be serialised.
    pub async fn write(&self, message: OutboundMessage) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(AppError::NotConnected(
                "transport is stopped or the process has exited".into(),
            ));
        };

        match writer.send(message).await {
            Ok(()) => Ok(()),
            Err(AppError::Io(msg)) => {
                warn!(pid = ?self.pid, error = %msg, "write to server stdin failed");
                guard.take();
                Err(AppError::BrokenPipe(msg))
            }
            Err(other) => Err(other),
        }
    }

    /// Terminate the process and release its handles.
    ///
    /// Closes stdin, asks the process to exit (SIGTERM on unix), and kills
    /// it if it is still alive after the grace period. Returns once the
    /// process has been reaped. Calling it again is a no-op; a concurrent
    /// caller also waits for the reap.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if the exit monitor task panicked.
    pub async fn stop(&self) -> Result<()> {
        // Held until the monitor finishes so no caller returns early.
        let mut slot = self.shutdown.lock().await;
        let Some(Shutdown { stop_tx, monitor }) = slot.take() else {
            return Ok(());
        };

        // Fails only when the monitor already saw the process exit.
        let _ = stop_tx.send(());

        monitor
            .await
            .map_err(|err| AppError::Transport(format!("exit monitor failed: {err}")))
    }
}

// ── Exit monitor ─────────────────────────────────────────────────────────────

/// Own `child` until it exits or a stop is requested.
///
/// On a natural exit the writer slot is cleared and the exit is reported.
/// On a stop request (or when the transport is dropped) the process is
/// terminated without emitting an event.
async fn monitor_exit(
    mut child: Child,
    writer: Arc<Mutex<Option<StdinWriter>>>,
    mut stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let pid = child.id();

    tokio::select! {
        result = child.wait() => {
            writer.lock().await.take();

            let event = match result {
                Ok(status) => {
                    let (code, signal) = (status.code(), exit_signal(status));
                    info!(?pid, ?code, ?signal, "server process exited");
                    TransportEvent::Exited { code, signal }
                }
                Err(err) => {
                    warn!(?pid, %err, "error waiting for server process");
                    TransportEvent::ErrorOccurred(format!("wait error: {err}"))
                }
            };

            if event_tx.send(event).await.is_err() {
                debug!(?pid, "transport event channel closed before exit was delivered");
            }
        }
        _ = &mut stop_rx => {
            terminate(&mut child, &writer, grace).await;
        }
    }
}

/// Graceful stop: close stdin, signal, wait, then kill.
///
/// Never waits on the stdin lock before the process is dead: a write blocked
/// on a full pipe holds it until the reader goes away.
async fn terminate(child: &mut Child, writer: &Mutex<Option<StdinWriter>>, grace: Duration) {
    let pid = child.id();

    // EOF on stdin is the conventional shutdown request for stdio servers.
    // Dropping closes the pipe without flushing what the child never read.
    match writer.try_lock() {
        Ok(mut slot) => drop(slot.take()),
        Err(_) => debug!(?pid, "stdin busy with a blocked write, signalling only"),
    }

    request_exit(pid);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?pid, code = ?status.code(), "server process stopped");
        }
        Ok(Err(err)) => {
            warn!(?pid, %err, "error waiting for server process during stop");
        }
        Err(_elapsed) => {
            warn!(?pid, ?grace, "server process ignored stop request, killing");
            if let Err(err) = child.kill().await {
                warn!(?pid, %err, "failed to kill server process");
            }
        }
    }

    // With the child gone a blocked write fails with EPIPE and releases the
    // lock. A grandchild may still hold the pipe open, so bound the wait.
    match tokio::time::timeout(grace, writer.lock()).await {
        Ok(mut slot) => drop(slot.take()),
        Err(_elapsed) => warn!(?pid, "stdin still blocked after the process was reaped"),
    }
}

#[cfg(unix)]
fn request_exit(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid = raw, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_exit(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

// ── Diagnostic sink ──────────────────────────────────────────────────────────

/// Forward each stderr line to `tracing` until the pipe closes.
///
/// Lines are read as raw bytes so invalid UTF-8 cannot end the drain and
/// leave the child blocked on a full pipe.
fn spawn_stderr_sink(stderr: ChildStderr, pid: Option<u32>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        debug!(target: STDERR_TARGET, ?pid, "{text}");
                    }
                }
                Err(err) => {
                    debug!(target: STDERR_TARGET, ?pid, %err, "stderr read failed");
                    break;
                }
            }
        }
    })
}
