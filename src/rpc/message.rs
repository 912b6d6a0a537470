//! JSON-RPC 2.0 wire messages.
//!
//! Outbound traffic is either a request (carries an `id`, expects exactly one
//! response) or a notification (no `id`, no response). Inbound frames decode
//! into [`InboundMessage`]: responses are correlated by id, while anything
//! carrying a `method` was initiated by the server and is surfaced as an
//! event instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Value of the `jsonrpc` field on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier. Allocated by the correlator, unique per connection.
pub type RequestId = u64;

/// A message written to the child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    /// A call expecting exactly one response.
    Request {
        /// Protocol version marker.
        jsonrpc: &'static str,
        /// Correlation identifier.
        id: RequestId,
        /// Remote method name.
        method: String,
        /// Method parameters.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// A one-way message; the peer sends nothing back.
    Notification {
        /// Protocol version marker.
        jsonrpc: &'static str,
        /// Remote method name.
        method: String,
        /// Method parameters.
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl OutboundMessage {
    /// Build a request frame.
    #[must_use]
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        }
    }

    /// Build a notification frame.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params: params.filter(|p| !p.is_null()),
        }
    }

    /// Correlation id, `None` for notifications.
    #[must_use]
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Request { id, .. } => Some(*id),
            Self::Notification { .. } => None,
        }
    }

    /// Remote method name.
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => method,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// JSON-RPC error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcErrorObject> for AppError {
    fn from(err: RpcErrorObject) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// A decoded frame read from the child's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to a request we sent.
    Response {
        /// Id of the originating request.
        id: RequestId,
        /// `result` on success, `error` on failure.
        outcome: std::result::Result<Value, RpcErrorObject>,
    },
    /// Server-initiated notification.
    Notification {
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
    /// Server-initiated request. Not correlated against our pending table.
    Request {
        /// Peer-chosen id, kept verbatim.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
}

impl InboundMessage {
    /// Decode one frame.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the frame is not JSON, is not an
    /// object, names another protocol version, or is a response without a
    /// usable id or without either `result` or `error`.
    pub fn from_slice(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

        let Value::Object(obj) = value else {
            return Err(AppError::Protocol("frame is not a json object".into()));
        };

        Self::from_object(obj)
    }

    fn from_object(mut obj: Map<String, Value>) -> Result<Self> {
        match obj.get("jsonrpc") {
            None => {}
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(AppError::Protocol(format!(
                    "unsupported jsonrpc version: {other}"
                )));
            }
        }

        let id = obj.remove("id").filter(|id| !id.is_null());
        let params = obj.remove("params");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(AppError::Protocol("method must be a string".into()));
            };
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err(AppError::Protocol(
                "message carries neither a method nor an id".into(),
            ));
        };
        let id = parse_request_id(&id)?;

        if let Some(error) = obj.remove("error") {
            let error: RpcErrorObject = serde_json::from_value(error)
                .map_err(|e| AppError::Protocol(format!("invalid error object: {e}")))?;
            return Ok(Self::Response {
                id,
                outcome: Err(error),
            });
        }

        match obj.remove("result") {
            Some(result) => Ok(Self::Response {
                id,
                outcome: Ok(result),
            }),
            None => Err(AppError::Protocol(format!(
                "response {id} missing both result and error"
            ))),
        }
    }
}

/// Accept numeric ids and numeric strings; we only ever send numbers.
fn parse_request_id(id: &Value) -> Result<RequestId> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| AppError::Protocol(format!("response id {id} does not match any request form")))
}
