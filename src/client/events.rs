//! Lifecycle and traffic events delivered to the client's owner.
//!
//! Two delivery paths share the owner's channel:
//! - traffic (`Notification`, `ServerRequest`, `FrameDropped`, `ToolCalled`)
//!   goes through `emit`, which never waits and drops on a full channel so
//!   the reader loop cannot stall behind a slow owner;
//! - lifecycle (`Started`, `HandshakeComplete`, `ProcessExited`, `Error`,
//!   `Stopped`) goes through `Lifecycle`, which queues and forwards every
//!   event in order, waiting for room on the channel.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::handshake::ServerInfo;

/// Events emitted on the owner's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The child process was spawned.
    Started {
        /// OS process id, when available.
        pid: Option<u32>,
    },
    /// The handshake succeeded; the client is ready.
    HandshakeComplete {
        /// Identity and capabilities reported by the server.
        server: ServerInfo,
    },
    /// The server sent a notification.
    Notification {
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
    /// The server sent a request; it is not answered by the client.
    ServerRequest {
        /// Peer-chosen request id.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
    /// An inbound frame was discarded.
    FrameDropped {
        /// Why the frame was discarded.
        reason: String,
    },
    /// The child process exited while the connection was live.
    ProcessExited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<i32>,
    },
    /// A transport or startup failure ended the connection.
    Error {
        /// Description of the failure.
        message: String,
    },
    /// The connection reached the `Stopped` state.
    Stopped {
        /// What stopped it.
        reason: String,
    },
    /// A `tools/call` finished.
    ToolCalled {
        /// Tool name as the caller gave it.
        name: String,
        /// Time from sending the request to its outcome.
        duration: Duration,
        /// True when the call failed or the tool reported an error.
        is_error: bool,
    },
}

/// Deliver `event` without waiting.
///
/// The reader loop calls this for every server message, so a slow owner
/// must not stall correlation; a full channel drops the event.
pub(crate) fn emit(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(?event, "event channel full, dropping client event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, client event discarded");
        }
    }
}

type Forward = (mpsc::UnboundedReceiver<ClientEvent>, mpsc::Sender<ClientEvent>);

/// Lossless, ordered delivery of lifecycle events.
///
/// Events are queued without bound and forwarded by one task that awaits
/// room on the owner's channel. A full channel delays lifecycle events
/// instead of dropping them, and the connection never waits on the owner.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    queue: mpsc::UnboundedSender<ClientEvent>,
    /// Forwarder inputs until the first event starts the task.
    idle: Mutex<Option<Forward>>,
}

impl Lifecycle {
    pub(crate) fn new(event_tx: mpsc::Sender<ClientEvent>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            queue,
            idle: Mutex::new(Some((rx, event_tx))),
        }
    }

    /// Queue `event` for delivery. Must run inside a tokio runtime.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((rx, event_tx)) = idle {
            tokio::spawn(forward(rx, event_tx));
        }
        if self.queue.send(event).is_err() {
            debug!("lifecycle forwarder gone, event discarded");
        }
    }
}

/// Ends once the queue's sender is dropped and drained, or the owner hangs up.
async fn forward(
    mut rx: mpsc::UnboundedReceiver<ClientEvent>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    while let Some(event) = rx.recv().await {
        if event_tx.send(event).await.is_err() {
            debug!("event channel closed, lifecycle forwarding stopped");
            return;
        }
    }
}
