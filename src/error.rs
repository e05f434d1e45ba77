//! Error types for message dispatch

use thiserror::Error;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Main error type for RobotCopy dispatch and its resilience primitives
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Rejected by the throttle policy before any network attempt
    #[error("Throttle limit exceeded; try again later")]
    Throttled,

    /// Rejected by an open circuit breaker before any network attempt
    #[error("Circuit breaker {name} is open")]
    CircuitOpen { name: String },

    /// Network-level failure talking to the backend
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Backend answered with a non-2xx status
    #[error("HTTP {status}: {status_text}")]
    HttpStatus { status: u16, status_text: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    /// Stable machine-readable code, distinct for admission rejections and backend failures.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Throttled => "THROTTLED",
            DispatchError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            DispatchError::Transport { .. } => "TRANSPORT",
            DispatchError::HttpStatus { .. } => "HTTP_STATUS",
            DispatchError::Serialization(_) => "SERIALIZATION",
            DispatchError::Io(_) => "IO",
            DispatchError::Config(_) => "CONFIG",
            DispatchError::Other(_) => "OTHER",
        }
    }

    /// Transport failures and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Transport { .. } => true,
            DispatchError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        DispatchError::Transport {
            message: err.to_string(),
        }
    }

    /// Recovers a `DispatchError` raised inside a layered transport; anything else is a transport failure.
    pub(crate) fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(err) => *err,
            Err(other) => DispatchError::transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::HttpStatus {
            status: 503,
            status_text: "Service Unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: Service Unavailable");

        let err = DispatchError::CircuitOpen {
            name: "robot-copy".to_string(),
        };
        assert_eq!(err.to_string(), "Circuit breaker robot-copy is open");
    }

    #[test]
    fn test_admission_codes_are_distinct() {
        assert_eq!(DispatchError::Throttled.code(), "THROTTLED");
        assert_eq!(
            DispatchError::CircuitOpen { name: "x".into() }.code(),
            "CIRCUIT_OPEN"
        );
        assert_ne!(
            DispatchError::transport("connection refused").code(),
            DispatchError::Throttled.code()
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::transport("reset by peer").is_retryable());
        assert!(DispatchError::HttpStatus {
            status: 500,
            status_text: "Internal Server Error".into()
        }
        .is_retryable());
        assert!(!DispatchError::HttpStatus {
            status: 404,
            status_text: "Not Found".into()
        }
        .is_retryable());
        assert!(!DispatchError::Throttled.is_retryable());
        assert!(!DispatchError::CircuitOpen { name: "x".into() }.is_retryable());
    }

    #[test]
    fn test_boxed_errors_keep_their_kind() {
        let boxed: tower::BoxError = Box::new(DispatchError::Throttled);
        assert_eq!(DispatchError::from_boxed(boxed).code(), "THROTTLED");

        let boxed: tower::BoxError = "connection refused".into();
        let err = DispatchError::from_boxed(boxed);
        assert_eq!(err.code(), "TRANSPORT");
        assert_eq!(err.to_string(), "Transport error: connection refused");
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: DispatchError = serde_err.into();
        assert!(matches!(err, DispatchError::Serialization(_)));
        assert_eq!(err.code(), "SERIALIZATION");
    }
}
