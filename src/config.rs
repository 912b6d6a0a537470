//! Client configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Protocol revision announced in the `initialize` handshake by default.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Default inbound frame limit: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

/// How to launch the child process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Executable path or name resolved through `PATH`.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child; inherits ours when absent.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Strip the inherited environment down to a safe allowlist.
    #[serde(default)]
    pub isolate_env: bool,
    /// Extra environment variables set on the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Identity announced to the server during the handshake.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientIdentity {
    /// Client name sent as `clientInfo.name`.
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Client version sent as `clientInfo.version`.
    #[serde(default = "default_client_version")]
    pub version: String,
    /// Protocol revision requested in `initialize`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
            protocol_version: default_protocol_version(),
        }
    }
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").into()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.into()
}

/// Timeouts governing the connection lifecycle.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for the `initialize` response.
    #[serde(default = "default_handshake_seconds")]
    pub handshake_seconds: u64,
    /// Default deadline for generic requests.
    #[serde(default = "default_request_seconds")]
    pub request_seconds: u64,
    /// Deadline for `tools/call` requests.
    #[serde(default = "default_tool_call_seconds")]
    pub tool_call_seconds: u64,
    /// Grace period between asking the child to stop and killing it.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// How long to wait for an exit status after stdout closes.
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_seconds: default_handshake_seconds(),
            request_seconds: default_request_seconds(),
            tool_call_seconds: default_tool_call_seconds(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            exit_grace_ms: default_exit_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Handshake deadline as a [`Duration`].
    #[must_use]
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_seconds)
    }

    /// Generic request deadline as a [`Duration`].
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_seconds)
    }

    /// Tool call deadline as a [`Duration`].
    #[must_use]
    pub fn tool_call(&self) -> Duration {
        Duration::from_secs(self.tool_call_seconds)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Exit-status grace period as a [`Duration`].
    #[must_use]
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

fn default_handshake_seconds() -> u64 {
    30
}

fn default_request_seconds() -> u64 {
    30
}

fn default_tool_call_seconds() -> u64 {
    120
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_exit_grace_ms() -> u64 {
    500
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

/// Glob patterns deciding which remote tools are exposed.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ToolsConfig {
    /// When present, only tools matching one of these patterns are exposed.
    #[serde(default)]
    pub allowed: Option<Vec<String>>,
    /// Tools matching any of these patterns are never exposed.
    #[serde(default)]
    pub blocked: Vec<String>,
    /// Prepended to every exposed tool name, e.g. `"fs_"` turns `read`
    /// into `fs_read`. Patterns always match the server's own names.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Top-level client configuration parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClientConfig {
    /// Child process launch settings.
    pub server: ServerConfig,
    /// Handshake identity.
    #[serde(default)]
    pub client: ClientIdentity,
    /// Lifecycle and request deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Tool exposure filter.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Inbound frames longer than this are discarded.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    /// Build a configuration with defaults for everything but the command line.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            server: ServerConfig {
                command: command.into(),
                args,
                working_dir: None,
                isolate_env: false,
                env: HashMap::new(),
            },
            client: ClientIdentity::default(),
            timeouts: TimeoutConfig::default(),
            tools: ToolsConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.server.command.trim().is_empty() {
            return Err(AppError::Config("server.command must not be empty".into()));
        }

        if self.max_frame_bytes == 0 {
            return Err(AppError::Config(
                "max_frame_bytes must be greater than zero".into(),
            ));
        }

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("handshake_seconds", timeouts.handshake_seconds),
            ("request_seconds", timeouts.request_seconds),
            ("tool_call_seconds", timeouts.tool_call_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }

        let allowed = self.tools.allowed.iter().flatten();
        for pattern in allowed.chain(self.tools.blocked.iter()) {
            glob::Pattern::new(pattern).map_err(|err| {
                AppError::Config(format!("invalid tool pattern '{pattern}': {err}"))
            })?;
        }

        Ok(())
    }
}
