#![forbid(unsafe_code)]

//! JSON-RPC 2.0 client for tool servers running as child processes.
//!
//! The server is spawned with piped stdio and spoken to in newline-delimited
//! JSON. [`Client`] performs the `initialize` handshake, correlates
//! concurrent requests with their responses, and reports lifecycle changes
//! as [`ClientEvent`]s.

pub mod client;
pub mod config;
pub mod errors;
pub mod rpc;
pub mod transport;

pub use client::{Client, ClientEvent, ConnectionState};
pub use config::ClientConfig;
pub use errors::{AppError, Result};
