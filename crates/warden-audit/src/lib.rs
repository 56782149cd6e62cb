//! Warden Audit - scheduled full-system audits with escalation
//!
//! Provides:
//! - The senior audit daemon: correlation, adaptive timeouts, retry with backoff
//! - Audit and spawn history over SQLite
//! - Parallel infrastructure diagnostics with ordered root-cause rules
//! - Remediation pattern matching and escalation ticket rendering
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_audit::prelude::*;
//!
//! let diagnostics = Arc::new(AuditDiagnostics::new(bus.clone(), Arc::new(ProcHostProbe::default())));
//! let daemon = SeniorAuditDaemon::new(bus, store, diagnostics, config.audit.clone());
//! match daemon.run_audit(AuditType::full_system()).await {
//!     Ok(result) => println!("{}", result.overall_status.as_str()),
//!     Err(e) if e.is_fatal() => std::process::exit(1),
//!     Err(e) => eprintln!("{e}"),
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod correlation;
pub mod daemon;
pub mod diagnostics;
pub mod error;
pub mod history;
pub mod host;
pub mod patterns;
pub mod report;
pub mod tickets;
pub mod timeout;

pub use correlation::{Correlator, PendingAudit};
pub use daemon::{Escalation, SeniorAuditDaemon, SpawnRequest};
pub use diagnostics::{AuditDiagnostics, BusHealth, DiagnosticReport, Finding, SpawnHealth, StreamHealth};
pub use error::{AuditError, HistoryError};
pub use history::{
    AuditHistory, DatabaseHealth, DatabaseProbe, InMemoryAuditHistory, SpawnHistory, SpawnRecord,
    SqliteAuditStore,
};
pub use host::{HostHealth, HostProbe, ProcHostProbe};
pub use patterns::{match_remediations, RemediationTicket};
pub use timeout::{RetryPolicy, TimeoutPolicy};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Warden Audit
    pub use crate::{
        AuditDiagnostics, AuditError, AuditHistory, DiagnosticReport, ProcHostProbe,
        SeniorAuditDaemon, SqliteAuditStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
