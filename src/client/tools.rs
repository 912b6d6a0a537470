//! Named remote operations: tool discovery, tool invocation, and ping.
//!
//! These are typed wrappers over [`Client::call`]. The only state they add
//! is the tool cache, keyed by the server's name and refreshed by every
//! [`Client::list_tools`]. Exposed names carry the configured prefix; the
//! glob filter always sees the server's own names.

use std::collections::HashSet;
use std::sync::PoisonError;
use std::time::Instant;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::events::emit;
use crate::client::{Client, ClientEvent};
use crate::config::ToolsConfig;
use crate::{AppError, Result};

/// Method listing the server's tools.
pub const TOOLS_LIST: &str = "tools/list";

/// Method invoking one tool.
pub const TOOLS_CALL: &str = "tools/call";

/// Liveness check.
pub const PING: &str = "ping";

/// One tool advertised by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name used with `tools/call`.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the tool's arguments.
    #[serde(default)]
    pub input_schema: Value,
    /// Name exposed to callers: the configured prefix followed by `name`.
    /// Empty until the tool passes through [`Client::update_tools`].
    #[serde(skip_deserializing, skip_serializing_if = "String::is_empty")]
    pub prefixed_name: String,
}

/// One page of a `tools/list` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolPage {
    #[serde(default)]
    tools: Vec<ToolInfo>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// One item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Base64-encoded image.
    Image {
        /// Encoded bytes.
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource, kept opaque.
    Resource {
        /// Resource payload.
        resource: Value,
    },
    /// Any content type this client does not model.
    #[serde(other)]
    Unknown,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Content items returned by the tool.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// True when the tool itself reported a failure.
    #[serde(default)]
    pub is_error: bool,
    /// Machine-readable result, when the tool provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolCallResult {
    /// Concatenate all text blocks, one per line.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Allow/block decision for remote tool names.
///
/// A name is exposed when it matches no blocked pattern and, if an allow
/// list is configured, matches at least one allowed pattern.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    allowed: Option<Vec<Pattern>>,
    blocked: Vec<Pattern>,
}

impl ToolFilter {
    /// Compile the configured glob patterns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a pattern that is not a valid glob.
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        let allowed = config
            .allowed
            .as_ref()
            .map(|patterns| compile(patterns))
            .transpose()?;
        let blocked = compile(&config.blocked)?;
        Ok(Self { allowed, blocked })
    }

    /// Whether `name` may be listed and called.
    #[must_use]
    pub fn is_allowed(&self, name: &str) -> bool {
        if self.blocked.iter().any(|p| p.matches(name)) {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|p| p.matches(name)),
            None => true,
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|raw| {
            Pattern::new(raw).map_err(|err| {
                AppError::Config(format!("invalid tool pattern '{raw}': {err}"))
            })
        })
        .collect()
}

impl Client {
    /// List the server's tools, following pagination, minus filtered names.
    ///
    /// Refreshes the tool cache with the result.
    ///
    /// # Errors
    ///
    /// Any [`Client::call`] error, or `AppError::Protocol` for a malformed
    /// page or a cursor the server already returned.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request(TOOLS_LIST, params).await?;
            let page: ToolPage = serde_json::from_value(result)
                .map_err(|e| AppError::Protocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(AppError::Protocol(format!(
                        "tools/list returned cursor '{next}' twice"
                    )));
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(self.update_tools(tools))
    }

    /// Configured tool name prefix, if any.
    #[must_use]
    pub fn tool_prefix(&self) -> Option<&str> {
        self.inner
            .config
            .tools
            .prefix
            .as_deref()
            .filter(|prefix| !prefix.is_empty())
    }

    /// `name` as exposed to callers.
    #[must_use]
    pub fn apply_prefix(&self, name: &str) -> String {
        match self.tool_prefix() {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_owned(),
        }
    }

    /// Replace the tool cache with the filtered subset of `tools`.
    ///
    /// Returns the exposed tools in their original order, with
    /// [`ToolInfo::prefixed_name`] set.
    #[must_use]
    pub fn update_tools(&self, tools: Vec<ToolInfo>) -> Vec<ToolInfo> {
        let total = tools.len();
        let filter = &self.inner.filter;
        let exposed: Vec<ToolInfo> = tools
            .into_iter()
            .filter(|tool| filter.is_allowed(&tool.name))
            .map(|mut tool| {
                tool.prefixed_name = self.apply_prefix(&tool.name);
                tool
            })
            .collect();

        let mut cache = self
            .inner
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        cache.clear();
        for tool in &exposed {
            cache.insert(tool.name.clone(), tool.clone());
        }
        debug!(total, exposed = exposed.len(), "tool cache updated");
        exposed
    }

    /// Cached tools, sorted by name. Empty until the first listing.
    #[must_use]
    pub fn tools(&self) -> Vec<ToolInfo> {
        let cache = self
            .inner
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut tools: Vec<ToolInfo> = cache.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Cached tool by the server's name.
    #[must_use]
    pub fn get_tool(&self, name: &str) -> Option<ToolInfo> {
        self.inner
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Cached tool by its exposed name.
    #[must_use]
    pub fn get_tool_by_prefixed_name(&self, prefixed_name: &str) -> Option<ToolInfo> {
        self.inner
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|tool| tool.prefixed_name == prefixed_name)
            .cloned()
    }

    /// Server name for a caller-supplied tool name.
    ///
    /// Cached exposed names win, then cached server names. An uncached name
    /// loses the configured prefix when it carries it.
    fn resolve_tool_name(&self, name: &str) -> String {
        if let Some(tool) = self.get_tool_by_prefixed_name(name) {
            return tool.name;
        }
        if self.get_tool(name).is_some() {
            return name.to_owned();
        }
        self.tool_prefix()
            .and_then(|prefix| name.strip_prefix(prefix))
            .unwrap_or(name)
            .to_owned()
    }

    /// Invoke the tool `name` with `arguments`.
    ///
    /// `name` may be the exposed (prefixed) name or the server's own name.
    /// Uses the configured tool-call timeout. A tool that reports failure
    /// still returns `Ok` with [`ToolCallResult::is_error`] set. Every call
    /// that reaches the server is reported as [`ClientEvent::ToolCalled`].
    ///
    /// # Errors
    ///
    /// - `AppError::ToolBlocked` when the filter hides `name`; nothing is sent.
    /// - Any [`Client::call`] error.
    /// - `AppError::Protocol` for a malformed result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let target = self.resolve_tool_name(name);
        if !self.inner.filter.is_allowed(&target) {
            return Err(AppError::ToolBlocked(format!(
                "tool '{name}' is not permitted by the tool filter"
            )));
        }

        let started = Instant::now();
        let outcome = self.invoke_tool(&target, arguments).await;
        let duration = started.elapsed();
        let is_error = match &outcome {
            Ok(result) => result.is_error,
            Err(_) => true,
        };

        info!(tool = name, server_name = %target, is_error, ?duration, "tool call finished");
        emit(
            &self.inner.event_tx,
            ClientEvent::ToolCalled {
                name: name.to_owned(),
                duration,
                is_error,
            },
        );
        outcome
    }

    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let params = json!({ "name": name, "arguments": arguments });
        let result = self
            .call(TOOLS_CALL, params, self.inner.config.timeouts.tool_call())
            .await?;

        serde_json::from_value(result)
            .map_err(|e| AppError::Protocol(format!("invalid tools/call result: {e}")))
    }

    /// Round-trip a `ping` request.
    ///
    /// # Errors
    ///
    /// Any [`Client::call`] error.
    pub async fn ping(&self) -> Result<()> {
        self.request(PING, json!({})).await.map(drop)
    }
}
