//! Herald Error Types

use thiserror::Error;

/// Result type alias for Herald operations
pub type Result<T> = std::result::Result<T, Error>;

/// Herald error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Unexpected response from store ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid store payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid base64 in store payload: {0}")]
    Base64(#[from] base64::DecodeError),

    // Election errors
    #[error("Malformed leader value {0:?}")]
    MalformedLeader(String),

    #[error("Session {0} is no longer alive")]
    SessionExpired(i64),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailed { .. }
            | Error::Timeout(_)
            | Error::UnexpectedResponse { .. }
            | Error::SessionExpired(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Build a connection error from a failed request against `endpoint`
    pub(crate) fn from_request(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(endpoint.to_string())
        } else if err.is_connect() {
            Error::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        } else {
            Error::Http(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Timeout("http://127.0.0.1:2379".into()).is_retryable());
        assert!(Error::ConnectionFailed {
            endpoint: "http://127.0.0.1:2379".into(),
            reason: "refused".into(),
        }
        .is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::MalformedLeader("abc".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnexpectedResponse { status: 500, body: "boom".into() };
        assert_eq!(err.to_string(), "Unexpected response from store (500): boom");
        assert_eq!(
            Error::MalformedLeader("x1".into()).to_string(),
            "Malformed leader value \"x1\""
        );
    }
}
