//! Process transport: the child process and its stdio pipes.

pub mod process;

pub use process::{ProcessTransport, SpawnedProcess};

/// Lifecycle events reported by the transport and its companion tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The child process was spawned.
    Started {
        /// OS process id, when available.
        pid: Option<u32>,
    },
    /// The child process exited on its own.
    Exited {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Terminating signal, if any.
        signal: Option<i32>,
    },
    /// Waiting on the process or reading its output failed.
    ErrorOccurred(String),
    /// The child's stdout reached end of file.
    StreamClosed,
}
