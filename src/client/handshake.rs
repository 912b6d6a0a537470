//! `initialize` handshake payloads.
//!
//! The client opens every connection with one `initialize` request carrying
//! its identity and requested protocol revision:
//!
//! ```json
//! {
//!   "jsonrpc": "2.0",
//!   "id": 1,
//!   "method": "initialize",
//!   "params": {
//!     "protocolVersion": "2024-11-05",
//!     "capabilities": {},
//!     "clientInfo": { "name": "toolpipe", "version": "0.1.0" }
//!   }
//! }
//! ```
//!
//! The response describes the server. Once it arrives the client sends the
//! `notifications/initialized` notification and becomes ready.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientIdentity;
use crate::{AppError, Result};

/// Method of the handshake request.
pub const INITIALIZE: &str = "initialize";

/// Notification sent once the handshake response has been accepted.
pub const INITIALIZED: &str = "notifications/initialized";

/// Name and version of one side of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Program name.
    pub name: String,
    /// Program version.
    #[serde(default)]
    pub version: String,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Requested protocol revision.
    pub protocol_version: String,
    /// Client capabilities; this client advertises none.
    pub capabilities: Value,
    /// Client identity.
    pub client_info: Implementation,
}

impl InitializeParams {
    /// Build the request parameters from the configured identity.
    #[must_use]
    pub fn from_identity(identity: &ClientIdentity) -> Self {
        Self {
            protocol_version: identity.protocol_version.clone(),
            capabilities: Value::Object(serde_json::Map::new()),
            client_info: Implementation {
                name: identity.name.clone(),
                version: identity.version.clone(),
            },
        }
    }
}

/// What the server reported about itself in the handshake response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Protocol revision the server agreed to.
    #[serde(default)]
    pub protocol_version: Option<String>,
    /// Server capabilities, kept opaque.
    #[serde(default)]
    pub capabilities: Value,
    /// Server identity.
    #[serde(default)]
    pub server_info: Option<Implementation>,
    /// Free-form usage hints.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl ServerInfo {
    /// Decode the `initialize` result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the result is not an object or a
    /// field has the wrong type.
    pub fn from_result(result: Value) -> Result<Self> {
        if !result.is_object() {
            return Err(AppError::Protocol(format!(
                "initialize result must be an object, got {result}"
            )));
        }
        serde_json::from_value(result)
            .map_err(|e| AppError::Protocol(format!("invalid initialize result: {e}")))
    }

    /// Server name, or `"unknown"` when it did not say.
    #[must_use]
    pub fn name(&self) -> &str {
        self.server_info
            .as_ref()
            .map_or("unknown", |info| info.name.as_str())
    }
}
