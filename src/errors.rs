//! Error types shared across the crate.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of a stdio RPC connection.
///
/// The type is `Clone` because a single transport-level cause is delivered
/// to every request that was still pending when the connection failed.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The child process could not be launched.
    Spawn(String),
    /// Writing to the child's stdin failed.
    BrokenPipe(String),
    /// The transport is stopped or the child has exited.
    NotConnected(String),
    /// The child process exited while the connection was live.
    ProcessExited {
        /// Exit code, when the process exited normally.
        code: Option<i32>,
        /// Terminating signal, when the process was killed by one.
        signal: Option<i32>,
    },
    /// The output stream failed or closed underneath the connection.
    Transport(String),
    /// A frame or result payload did not have the expected structure.
    Protocol(String),
    /// The peer answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message.
        message: String,
        /// Optional structured error payload.
        data: Option<serde_json::Value>,
    },
    /// No response arrived before the request deadline.
    Timeout {
        /// Identifier of the request that timed out.
        id: u64,
        /// Method of the request that timed out.
        method: String,
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The connection was stopped by its owner.
    Stopped(String),
    /// The operation is not valid in the current connection state.
    InvalidState(String),
    /// The named tool is excluded by the configured tool filter.
    ToolBlocked(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error means the whole connection is unusable.
    ///
    /// Per-call failures (peer error objects, timeouts, blocked tools) leave
    /// the connection intact and return `false`.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_)
                | Self::BrokenPipe(_)
                | Self::NotConnected(_)
                | Self::ProcessExited { .. }
                | Self::Transport(_)
                | Self::Stopped(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::BrokenPipe(msg) => write!(f, "broken pipe: {msg}"),
            Self::NotConnected(msg) => write!(f, "not connected: {msg}"),
            Self::ProcessExited { code, signal } => match (code, signal) {
                (Some(code), _) => write!(f, "process exited: code {code}"),
                (None, Some(signal)) => write!(f, "process exited: signal {signal}"),
                (None, None) => write!(f, "process exited: status unknown"),
            },
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Rpc { code, message, .. } => write!(f, "rpc error {code}: {message}"),
            Self::Timeout { id, method, after } => {
                write!(f, "timeout: request {id} ({method}) got no response within {after:?}")
            }
            Self::Stopped(msg) => write!(f, "stopped: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::ToolBlocked(msg) => write!(f, "tool blocked: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
