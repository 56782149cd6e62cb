//! Error types for Warden Core
//!
//! Covers the collaborator boundaries every daemon crosses:
//! - Request store failures
//! - Message bus failures
//! - Opaque worker failures
//! - Configuration validation

use crate::types::RequestId;

/// Request store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Request does not exist
    #[error("request not found: {0}")]
    NotFound(RequestId),

    /// Store could not be reached
    #[error("request store unavailable: {0}")]
    Unavailable(String),

    /// Store answered with a non-success status
    #[error("request store returned {status}: {body}")]
    Http { status: u16, body: String },

    /// Response body could not be decoded
    #[error("invalid store response: {0}")]
    Decode(String),

    /// Update rejected by the store
    #[error("update rejected for {id}: {reason}")]
    Rejected { id: RequestId, reason: String },
}

impl StoreError {
    /// Check if error is a transient infrastructure failure
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Message bus errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Not connected to the bus
    #[error("message bus disconnected")]
    Disconnected,

    /// Publish failed
    #[error("publish to {subject} failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    /// Invalid subject or pattern
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// Payload could not be encoded or decoded
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Round-trip did not complete in time
    #[error("bus round-trip timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Connection to an external bus could not be established
    #[error("cannot connect to message bus at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// External bus rejected or failed a request
    #[error("message bus request failed: {0}")]
    Request(String),
}

impl BusError {
    /// Check if error is a transient infrastructure failure
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Disconnected
                | Self::PublishFailed { .. }
                | Self::Timeout(_)
                | Self::Connect { .. }
                | Self::Request(_)
        )
    }
}

/// Opaque worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Worker process could not be started
    #[error("worker spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    /// Worker exited unsuccessfully
    #[error("worker exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    /// Worker output was not a valid response
    #[error("invalid worker output: {0}")]
    InvalidOutput(String),

    /// Worker did not finish in time
    #[error("worker timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Required value missing
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// Value out of range or inconsistent
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    /// Create an invalid-field error
    #[inline]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::NotFound(RequestId::new("REQ-9"));
        assert!(err.to_string().contains("REQ-9"));
    }

    #[test]
    fn store_error_is_retryable() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(StoreError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!StoreError::Http {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!StoreError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn bus_error_is_retryable() {
        assert!(BusError::Disconnected.is_retryable());
        assert!(!BusError::InvalidSubject("a..b".into()).is_retryable());
    }

    #[test]
    fn config_error_invalid() {
        let err = ConfigError::invalid("audit.max_retries", "must be at most 10");
        assert!(err.to_string().contains("audit.max_retries"));
    }
}
