//! Warden Recovery - keeps in-flight pipeline work moving
//!
//! Provides:
//! - An in-memory stage ledger with stuck-work detection
//! - Orphan detection and reset of abandoned in-progress requests
//! - Progress reconstruction from bus history and resumption decisions
//! - The periodic recovery health check with process liveness
//! - A listener feeding stage events into the ledger and activity clocks
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_recovery::prelude::*;
//!
//! let daemon = RecoveryDaemon::new(store, bus, pipeline, config.recovery.clone());
//! let report = daemon.check().await;
//! println!("{}", report.status);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod health_check;
pub mod listener;
pub mod liveness;
pub mod orphan;
pub mod progress;
pub mod stage_tracker;

pub use error::RecoveryError;
pub use health_check::{HealthReport, HealthStatus, RecoveryAction, RecoveryDaemon, RequestRecovery};
pub use listener::StageEventListener;
pub use liveness::{BusRoundTripProbe, LivenessProbe, PidFileSupervisor, ProcessStatus};
pub use orphan::{OrphanDetector, OrphanReason, OrphanedWorkflow, SweepReport};
pub use progress::{decide_resumption, reconstruct, Progress, Resumption, StageProgress};
pub use stage_tracker::{SharedStageTracker, StageEntry, StageMetrics, StageTracker, StuckWork};

/// Next message on an optional trigger subscription
///
/// Pends forever without a subscription; drops the subscription once the bus
/// closes it.
pub(crate) async fn next_trigger(
    subscription: &mut Option<warden_core::Subscription>,
) -> Option<warden_core::BusMessage> {
    match subscription {
        Some(sub) => {
            let message = sub.next().await;
            if message.is_none() {
                *subscription = None;
            }
            message
        }
        None => std::future::pending().await,
    }
}

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Warden Recovery
    pub use crate::{
        HealthReport, HealthStatus, OrphanDetector, RecoveryDaemon, RecoveryError,
        SharedStageTracker, StageTracker, SweepReport,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
