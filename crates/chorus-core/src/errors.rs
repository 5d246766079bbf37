use std::time::Duration;

use serde_json::Value;

/// Failure taxonomy for one upstream completion stream.
///
/// Every variant except `Timeout` and `Cancelled` is a transport failure and
/// surfaces to callers as the Errored outcome.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    #[error("upstream returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Mid-stream `{error}` event; carries the upstream text verbatim.
    #[error("{0}")]
    Upstream(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn is_transport(&self) -> bool {
        !matches!(self, Self::Timeout(_) | Self::Cancelled)
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Network(_) => "network",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Protocol(_) => "protocol",
            Self::Upstream(_) => "upstream",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// The human-readable part of the error, without the classification prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Http { message, .. } => message.clone(),
            Self::Network(m)
            | Self::StreamInterrupted(m)
            | Self::Protocol(m)
            | Self::Upstream(m)
            | Self::InvalidRequest(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Classify a non-2xx response. Bodies shaped like `{"error": "..."}` or
    /// `{"error": {"message": "..."}}` contribute their message.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_error_message(body).unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                format!("HTTP {status}")
            } else {
                trimmed.to_string()
            }
        });
        match status {
            400 | 422 => Self::InvalidRequest(message),
            _ => Self::Http { status, message },
        }
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("message").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
