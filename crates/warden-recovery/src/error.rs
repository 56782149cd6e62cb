//! Error types for Warden Recovery

use warden_core::{BusError, RequestId, StoreError};

/// Recovery errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Request store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Message bus failure
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Stage completion history could not be read for a request
    #[error("progress reconstruction failed for {id}: {reason}")]
    Reconstruction { id: RequestId, reason: String },

    /// Co-located process could not be restarted
    #[error("failed to restart {name}: {reason}")]
    Restart { name: String, reason: String },

    /// Filesystem failure (pid files, logs)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// Check if error is a transient infrastructure failure
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Bus(e) => e.is_retryable(),
            Self::Reconstruction { .. } | Self::Io(_) => true,
            Self::Restart { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_follows_source() {
        assert!(RecoveryError::from(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!RecoveryError::from(StoreError::NotFound(RequestId::new("REQ-1"))).is_retryable());
        assert!(RecoveryError::from(BusError::Disconnected).is_retryable());
    }

    #[test]
    fn display_names_the_request() {
        let err = RecoveryError::Reconstruction {
            id: RequestId::new("REQ-4"),
            reason: "bus down".into(),
        };
        assert_eq!(err.to_string(), "progress reconstruction failed for REQ-4: bus down");
    }
}
