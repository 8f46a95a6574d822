//! Front-end wire types — one JSON object per line, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::CatalogSnapshot;

/// Request kinds a client may send.
pub const REQUEST_TYPES: [&str; 3] = ["list_capabilities", "invoke_capability", "set_subscription"];

// ─── Client → Proxy ─────────────────────────────────────────────────────────

/// A request from a front-end client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Re-send the current catalog.
    ListCapabilities,

    /// Call one capability.
    InvokeCapability {
        provider: String,
        name: String,
        #[serde(default = "empty_object")]
        arguments: Value,
        correlation_id: String,
    },

    /// Turn automatic catalog pushes on or off.
    SetSubscription { enabled: bool },
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Why a client line could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The line is not JSON at all. Ends the session.
    #[error("malformed request: {reason}")]
    Malformed { reason: String },

    /// JSON, but the `type` is not one we know.
    #[error("unknown request type '{request_type}'")]
    UnknownType { request_type: String },

    /// A known request with missing or ill-typed fields.
    #[error("invalid request: {reason}")]
    Invalid { reason: String },
}

impl RequestError {
    /// Whether the session must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Parse one line from a client.
pub fn parse_request(line: &str) -> Result<ClientRequest, RequestError> {
    let value: Value = serde_json::from_str(line).map_err(|e| RequestError::Malformed {
        reason: e.to_string(),
    })?;

    let request_type = match value.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => {
            return Err(RequestError::Invalid {
                reason: "'type' must be a string".into(),
            })
        }
        None => {
            return Err(RequestError::Invalid {
                reason: "missing 'type'".into(),
            })
        }
    };
    if !REQUEST_TYPES.contains(&request_type.as_str()) {
        return Err(RequestError::UnknownType { request_type });
    }

    let request: ClientRequest =
        serde_json::from_value(value).map_err(|e| RequestError::Invalid {
            reason: format!("{request_type}: {e}"),
        })?;

    if let ClientRequest::InvokeCapability { arguments, .. } = &request {
        if !arguments.is_object() {
            return Err(RequestError::Invalid {
                reason: "invoke_capability: 'arguments' must be an object".into(),
            });
        }
    }
    Ok(request)
}

// ─── Proxy → Client ─────────────────────────────────────────────────────────

/// Outcome of one capability call, tagged with the client's correlation id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityResult {
    pub correlation_id: String,
    pub provider: String,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    pub execution_time_ms: u64,
}

/// A message pushed to a front-end client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotification {
    CapabilitiesSnapshot(CatalogSnapshot),
    CapabilityResult(CapabilityResult),
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl ServerNotification {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            correlation_id: None,
        }
    }

    /// Serialize to one wire line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
