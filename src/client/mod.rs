//! Client facade.
//!
//! [`Client`] owns one server connection and its state machine:
//!
//! ```text
//! NotStarted ─start()─▶ Starting ─spawned─▶ Handshaking ─initialize ok─▶ Ready
//!      │                    │                    │                        │
//!      └────────────────────┴──── stop() / exit / error / failure ───────┴──▶ Stopped
//! ```
//!
//! Three background tasks serve a started client:
//! - the reader loop ([`crate::rpc::reader::run_reader`]) feeding the correlator,
//! - the process exit monitor inside [`ProcessTransport`],
//! - the supervisor, which turns fatal transport events into the `Stopped`
//!   transition and drains every pending request with the cause.

pub mod events;
pub mod handshake;
pub mod tools;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::rpc::codec::FrameCodec;
use crate::rpc::correlator::Correlator;
use crate::rpc::message::OutboundMessage;
use crate::rpc::reader::{run_reader, ReaderExit};
use crate::transport::{ProcessTransport, SpawnedProcess, TransportEvent};
use crate::{AppError, Result};

pub use events::ClientEvent;
pub use handshake::{Implementation, InitializeParams, ServerInfo};
pub use tools::{ContentBlock, ToolCallResult, ToolFilter, ToolInfo};

use events::Lifecycle;
use handshake::{INITIALIZE, INITIALIZED};

/// Buffer between the transport tasks and the supervisor.
const TRANSPORT_EVENT_CAPACITY: usize = 16;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed; `start` has not been called.
    NotStarted,
    /// Spawning the server process.
    Starting,
    /// Waiting for the `initialize` response.
    Handshaking,
    /// Requests and notifications may be sent.
    Ready,
    /// Terminal. Reached by `stop`, process exit, or any failure.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

struct Inner {
    config: ClientConfig,
    filter: ToolFilter,
    state: watch::Sender<ConnectionState>,
    correlator: Arc<Correlator>,
    transport: OnceLock<ProcessTransport>,
    server: OnceLock<ServerInfo>,
    event_tx: mpsc::Sender<ClientEvent>,
    lifecycle: Lifecycle,
    tools: RwLock<HashMap<String, ToolInfo>>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Ends the reader and supervisor; dropping the transport stops the child.
        self.cancel.cancel();
    }
}

/// JSON-RPC client for one server process.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("command", &self.inner.config.server.command)
            .field("state", &self.state())
            .field("pending", &self.inner.correlator.pending_count())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client that reports lifecycle events on `event_tx`.
    ///
    /// Nothing is spawned until [`Client::start`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `config` fails validation.
    pub fn new(config: ClientConfig, event_tx: mpsc::Sender<ClientEvent>) -> Result<Self> {
        config.validate()?;
        let filter = ToolFilter::from_config(&config.tools)?;
        let (state, _) = watch::channel(ConnectionState::NotStarted);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                filter,
                state,
                correlator: Arc::new(Correlator::new()),
                transport: OnceLock::new(),
                server: OnceLock::new(),
                lifecycle: Lifecycle::new(event_tx.clone()),
                tools: RwLock::new(HashMap::new()),
                event_tx,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Server description from the handshake, once it has completed.
    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.inner.server.get()
    }

    /// OS process id of the server, once spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.transport.get().and_then(ProcessTransport::pid)
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Spawn the server and perform the `initialize` handshake.
    ///
    /// Resolves once the client is [`ConnectionState::Ready`]. Any failure
    /// moves the client straight to [`ConnectionState::Stopped`], terminates
    /// the process, and is returned here.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if `start` was already called.
    /// - `AppError::Spawn` if the process cannot be launched.
    /// - `AppError::Timeout` if the server does not answer `initialize` in time.
    /// - `AppError::Rpc` / `AppError::Protocol` for a rejected or malformed
    ///   handshake response.
    /// - `AppError::ProcessExited` if the server dies during the handshake.
    pub async fn start(&self) -> Result<ServerInfo> {
        let inner = &self.inner;
        if !inner.advance(ConnectionState::NotStarted, ConnectionState::Starting) {
            return Err(AppError::InvalidState(format!(
                "start requires a client that has not been started, client is {}",
                self.state()
            )));
        }

        match self.connect().await {
            Ok(server) => Ok(server),
            Err(err) => {
                warn!(error = %err, "client startup failed");
                inner.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn connect(&self) -> Result<ServerInfo> {
        let inner = &self.inner;
        let config = &inner.config;

        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let SpawnedProcess { transport, stdout } = ProcessTransport::start(
            &config.server,
            config.timeouts.shutdown_grace(),
            transport_tx.clone(),
        )?;

        let pid = transport.pid();
        if let Err(orphan) = inner.transport.set(transport) {
            orphan.stop().await?;
            return Err(AppError::InvalidState(
                "a server process is already attached".into(),
            ));
        }

        inner.lifecycle.emit(ClientEvent::Started { pid });

        tokio::spawn(supervise(
            Arc::downgrade(inner),
            transport_rx,
            inner.cancel.clone(),
            config.timeouts.exit_grace(),
        ));
        tokio::spawn(read_output(
            stdout,
            FrameCodec::with_max_length(config.max_frame_bytes),
            Arc::clone(&inner.correlator),
            inner.event_tx.clone(),
            inner.cancel.clone(),
            transport_tx,
        ));

        if !inner.advance(ConnectionState::Starting, ConnectionState::Handshaking) {
            return Err(AppError::Stopped("client stopped during startup".into()));
        }

        let params = serde_json::to_value(InitializeParams::from_identity(&config.client))?;
        let result = inner
            .request(INITIALIZE, Some(params), config.timeouts.handshake())
            .await?;
        let server = ServerInfo::from_result(result)?;

        inner
            .write(OutboundMessage::notification(INITIALIZED, None))
            .await?;

        let _ = inner.server.set(server.clone());
        if !inner.advance(ConnectionState::Handshaking, ConnectionState::Ready) {
            return Err(AppError::Stopped("client stopped during handshake".into()));
        }

        info!(
            server = server.name(),
            protocol_version = ?server.protocol_version,
            "handshake complete, client ready"
        );
        inner.lifecycle.emit(ClientEvent::HandshakeComplete {
            server: server.clone(),
        });
        Ok(server)
    }

    /// Send a request and wait for its response.
    ///
    /// Each call is independent: any number may be in flight, and responses
    /// are matched by id regardless of arrival order.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` unless the client is ready; the transport
    ///   is not touched.
    /// - `AppError::Rpc` when the server answers with an error object.
    /// - `AppError::Timeout` when no response arrives within `timeout`.
    /// - The connection-level cause (`ProcessExited`, `Transport`, `Stopped`,
    ///   `BrokenPipe`) if the connection ends first.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.ensure_ready(method)?;
        self.inner.request(method, Some(params), timeout).await
    }

    /// [`Client::call`] with the configured default request timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Client::call`].
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params, self.inner.config.timeouts.request())
            .await
    }

    /// Send a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` unless the client is ready.
    /// - `AppError::BrokenPipe` / `AppError::NotConnected` if the write fails.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.ensure_ready(method)?;
        self.inner
            .write(OutboundMessage::notification(method, Some(params)))
            .await
    }

    /// Stop the client and terminate the server process.
    ///
    /// Every pending request is rejected with `AppError::Stopped`. Calling
    /// it again, or after the connection already ended, does nothing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the process could not be reaped.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.mark_stopped() {
            debug!("stop requested on a stopped client, ignoring");
            return Ok(());
        }

        let cause = AppError::Stopped("client stopped".into());
        let drained = inner.correlator.close(&cause);
        inner.cancel.cancel();
        info!(drained, "client stopping");

        let result = match inner.transport.get() {
            Some(transport) => transport.stop().await,
            None => Ok(()),
        };

        inner.lifecycle.emit(ClientEvent::Stopped {
            reason: cause.to_string(),
        });
        result
    }

    fn ensure_ready(&self, method: &str) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(AppError::InvalidState(format!(
                "cannot send '{method}': client is {state}"
            ))),
        }
    }
}

impl Inner {
    /// Move from `from` to `to`; false if the state was not `from`.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(%from, %to, "client state changed");
        }
        moved
    }

    /// Enter `Stopped`; false if already there.
    fn mark_stopped(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopped {
                false
            } else {
                *state = ConnectionState::Stopped;
                true
            }
        })
    }

    /// Register, write, and await one request.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.correlator.allocate_id();
        let pending = self.correlator.register(id, method, timeout);
        debug!(id, method, ?timeout, "sending request");

        // A write stuck on a full pipe must not outlive the deadline. An
        // abandoned send leaves its encoded frame buffered whole, so framing
        // stays intact for the next writer.
        let outcome = pending.wait();
        tokio::pin!(outcome);
        tokio::select! {
            written = self.write(OutboundMessage::request(id, method, params)) => {
                if let Err(err) = written {
                    // Resolves this caller now; a closed table already carries a cause.
                    self.correlator.reject(id, err);
                }
            }
            result = &mut outcome => return result,
        }
        outcome.await
    }

    async fn write(&self, message: OutboundMessage) -> Result<()> {
        let Some(transport) = self.transport.get() else {
            return Err(AppError::NotConnected("server process not started".into()));
        };
        let result = transport.write(message).await;
        if let Err(err @ AppError::BrokenPipe(_)) = &result {
            self.fail(err.clone()).await;
        }
        result
    }

    /// Fatal transition: stop, drain with `cause`, terminate the process.
    ///
    /// Events are emitted only by the call that performed the transition;
    /// teardown itself is repeated safely.
    async fn fail(&self, cause: AppError) {
        let transitioned = self.mark_stopped();
        let drained = self.correlator.close(&cause);
        self.cancel.cancel();

        if transitioned {
            warn!(error = %cause, drained, "connection lost");
            let event = match &cause {
                AppError::ProcessExited { code, signal } => ClientEvent::ProcessExited {
                    code: *code,
                    signal: *signal,
                },
                other => ClientEvent::Error {
                    message: other.to_string(),
                },
            };
            self.lifecycle.emit(event);
        }

        if let Some(transport) = self.transport.get() {
            if let Err(err) = transport.stop().await {
                warn!(error = %err, "failed to stop server process");
            }
        }

        if transitioned {
            self.lifecycle.emit(ClientEvent::Stopped {
                reason: cause.to_string(),
            });
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Run the reader loop and report how the output stream ended.
async fn read_output<R>(
    stdout: R,
    codec: FrameCodec,
    correlator: Arc<Correlator>,
    event_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
    transport_tx: mpsc::Sender<TransportEvent>,
) where
    R: AsyncRead + Unpin + Send,
{
    let event = match run_reader(stdout, codec, correlator, event_tx, cancel).await {
        ReaderExit::Cancelled => return,
        ReaderExit::Eof => TransportEvent::StreamClosed,
        ReaderExit::Failed(err) => TransportEvent::ErrorOccurred(err.to_string()),
    };
    if transport_tx.send(event).await.is_err() {
        debug!("supervisor gone, output stream end not reported");
    }
}

/// Consume transport events until a fatal one ends the connection.
///
/// An exit status and the end of stdout usually arrive together but in
/// either order. Whichever comes first waits up to `exit_grace` for the
/// other, so responses still buffered in the pipe are dispatched before
/// the drain and the drain cause names the exit status when there is one.
async fn supervise(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
    exit_grace: Duration,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else { return };

        let cause = match event {
            TransportEvent::Started { pid } => {
                debug!(?pid, "transport started");
                continue;
            }
            TransportEvent::ErrorOccurred(message) => AppError::Transport(message),
            TransportEvent::Exited { code, signal } => {
                let next = next_within(&mut events, &cancel, exit_grace).await;
                if !matches!(next, Some(TransportEvent::StreamClosed)) {
                    debug!("process exited before its output stream closed");
                }
                AppError::ProcessExited { code, signal }
            }
            TransportEvent::StreamClosed => {
                match next_within(&mut events, &cancel, exit_grace).await {
                    Some(TransportEvent::Exited { code, signal }) => {
                        AppError::ProcessExited { code, signal }
                    }
                    Some(TransportEvent::ErrorOccurred(message)) => AppError::Transport(message),
                    _ => AppError::Transport("output stream closed".into()),
                }
            }
        };

        if cancel.is_cancelled() {
            return;
        }
        if let Some(inner) = inner.upgrade() {
            inner.fail(cause).await;
        }
        return;
    }
}

/// Next transport event, or `None` on timeout, cancellation, or a closed channel.
async fn next_within(
    events: &mut mpsc::Receiver<TransportEvent>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Option<TransportEvent> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        next = tokio::time::timeout(grace, events.recv()) => next.ok().flatten(),
    }
}
