//! Error types for Warden Audit
//!
//! Covers:
//! - Audit history storage
//! - Audit round-trips, retries, and escalation

use warden_core::{BusError, RequestId, StoreError};

/// Audit history storage errors
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// SQLite failure
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Database file could not be prepared
    #[error("database io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored row could not be decoded
    #[error("corrupt history row: {0}")]
    Corrupt(String),

    /// Blocking task failed
    #[error("history task failed: {0}")]
    Task(String),
}

impl HistoryError {
    /// Check if error is a transient infrastructure failure
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Task(_) => true,
            _ => false,
        }
    }
}

/// Audit errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Bus failure while publishing or subscribing
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Request store failure while opening tickets
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// History failure
    #[error("history error: {0}")]
    History(#[from] HistoryError),

    /// Another audit is already in flight
    #[error("an audit is already running")]
    AlreadyRunning,

    /// Every attempt timed out and the audit was escalated
    #[error("audit {audit_id} escalated after {attempts} attempts")]
    Escalated {
        audit_id: String,
        attempts: u32,
        ticket: Option<RequestId>,
    },

    /// Shut down while waiting
    #[error("audit interrupted by shutdown")]
    Shutdown,

    /// Daily trigger could not be scheduled
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl AuditError {
    /// Check if error is a transient infrastructure failure
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bus(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            Self::History(e) => e.is_retryable(),
            Self::AlreadyRunning => true,
            Self::Escalated { .. } | Self::Shutdown | Self::Scheduler(_) => false,
        }
    }

    /// Check if the daemon must terminate
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_is_fatal_and_final() {
        let err = AuditError::Escalated {
            audit_id: "audit-1".into(),
            attempts: 4,
            ticket: None,
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "audit audit-1 escalated after 4 attempts");
    }

    #[test]
    fn transient_sources_are_retryable() {
        assert!(AuditError::from(BusError::Disconnected).is_retryable());
        assert!(AuditError::AlreadyRunning.is_retryable());
        assert!(!AuditError::Shutdown.is_fatal());
    }
}
