//! Wire types for parent-worker communication.
//!
//! Outbound requests are tagged by `action` and carry a correlation id
//! merged into the payload (except `shutdown`, which is fire-and-forget).
//! Inbound lines fall into three classes:
//! - status: `{"status": "..."}` with no id, informational only
//! - ack: `{"type":"ack","id":..,"event":..}`, non-terminal progress signal
//! - final response: `{"id":..,"success":..,"data"|"error":..}`

use serde::{Deserialize, Serialize};

/// Correlation id for an outbound request.
///
/// UUID v4: unique for the lifetime of the process, echoed verbatim by the
/// worker in acks and the final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Lightweight readiness probe.
    HealthCheck,

    /// Secret delivery after the readiness probe succeeds. Kept off the
    /// worker's environment so it never shows up in process listings.
    Configure { api_key: String },

    Extract { file_path: String },

    /// Fire-and-forget; the worker exits on receipt. Carries no id.
    Shutdown,
}

impl WorkerRequest {
    /// Whether a response is expected (and therefore an id attached).
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::Shutdown)
    }
}

/// Classified inbound line from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Status {
        status: String,
    },

    /// Non-terminal progress signal for an outstanding request.
    Ack {
        id: RequestId,
        event: String,
    },

    /// Terminal response settling exactly one outstanding request.
    Response {
        id: RequestId,
        success: bool,
        data: Option<serde_json::Value>,
        error: Option<String>,
    },

    /// Parsed as JSON but matching no known shape. Logged and discarded.
    Unrecognized(serde_json::Value),
}

impl WorkerMessage {
    pub fn classify(value: serde_json::Value) -> Self {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| RequestId::parse(s).ok());

        if value.get("type").and_then(|v| v.as_str()) == Some("ack") {
            if let (Some(id), Some(event)) = (id, value.get("event").and_then(|v| v.as_str())) {
                return Self::Ack {
                    id,
                    event: event.to_string(),
                };
            }
            return Self::Unrecognized(value);
        }

        if let (Some(id), Some(success)) = (id, value.get("success").and_then(|v| v.as_bool())) {
            return Self::Response {
                id,
                success,
                data: value.get("data").cloned(),
                error: value
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            };
        }

        if value.get("id").is_none()
            && let Some(status) = value.get("status").and_then(|v| v.as_str())
        {
            return Self::Status {
                status: status.to_string(),
            };
        }

        Self::Unrecognized(value)
    }
}

/// Ack event signalling that real work has begun on a request. The work
/// queue anchors its timeout clock to this, not to submission time.
pub const EVENT_PROCESSING_STARTED: &str = "processing_started";
