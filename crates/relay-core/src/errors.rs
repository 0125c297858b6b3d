use std::time::Duration;

/// Typed error hierarchy for everything that talks to the session API.
/// Classifies errors as retryable (transport trouble) or not (the server said no).
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Credential exchange
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // Rejected by the server
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("decode error: {0}")]
    Decode(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
                | Self::Timeout(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Decode(_) => "decode",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            400..=499 => Self::InvalidRequest(format!("status {status}: {body}")),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(RelayError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(RelayError::NetworkError("reset".into()).is_retryable());
        assert!(RelayError::StreamInterrupted("eof".into()).is_retryable());
        assert!(RelayError::Timeout(Duration::from_secs(15)).is_retryable());
    }

    #[test]
    fn rejections_are_not_retryable() {
        assert!(!RelayError::Unauthorized("expired".into()).is_retryable());
        assert!(!RelayError::AuthenticationFailed("bad token".into()).is_retryable());
        assert!(!RelayError::NotFound("session".into()).is_retryable());
        assert!(!RelayError::Cancelled.is_retryable());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(RelayError::from_status(401, String::new()), RelayError::Unauthorized(_)));
        assert!(matches!(RelayError::from_status(403, String::new()), RelayError::Unauthorized(_)));
        assert!(matches!(RelayError::from_status(404, String::new()), RelayError::NotFound(_)));
        assert!(matches!(RelayError::from_status(422, String::new()), RelayError::InvalidRequest(_)));
        assert!(RelayError::from_status(500, "internal".into()).is_retryable());
        assert!(RelayError::from_status(503, "unavailable".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(RelayError::Cancelled.error_kind(), "cancelled");
        assert_eq!(RelayError::Unauthorized(String::new()).error_kind(), "unauthorized");
        assert_eq!(
            RelayError::ServerError { status: 500, body: String::new() }.error_kind(),
            "server_error"
        );
    }

    #[test]
    fn json_errors_become_decode() {
        let err: RelayError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, RelayError::Decode(_)));
    }
}
