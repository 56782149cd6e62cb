//! Recovery health-check daemon
//!
//! Runs at startup, every configured interval (5 hours by default), and on a
//! manual trigger. Each sweep:
//! 1. Reconstructs the progress of every in-progress request from the bus
//! 2. Recovers those with no completion (or update) inside the stuck
//!    threshold: restart, resume at the next stage, or mark done
//! 3. Moves any request whose recovery fails to `blocked` with the reason
//! 4. Counts orphaned deliverables and probes process liveness
//! 5. Derives a healthy / degraded / critical verdict and broadcasts it
//!
//! A sweep never fails as a whole; a malfunction degrades the report to
//! critical.

use crate::error::RecoveryError;
use crate::liveness::{LivenessProbe, ProcessStatus};
use crate::progress::{decide_resumption, reconstruct, Resumption};
use crate::stage_tracker::{SharedStageTracker, StageMetrics, StuckWork};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warden_core::bus::{publish_json, subjects};
use warden_core::config::RecoveryConfig;
use warden_core::{
    Assignment, MessageBus, Phase, Pipeline, Request, RequestFilter, RequestId, RequestStore,
    StatusUpdate,
};

/// Overall verdict of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What recovery did to one stuck request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-schedulable again, starting from `next_stage`
    Rescheduled {
        /// Last stage with a completion event
        last_completed: Option<String>,
        /// Stage the request resumes at
        next_stage: String,
    },
    /// Every stage had completed; marked done
    Completed,
    /// Recovery failed; moved to blocked
    Blocked { reason: String },
}

/// Recovery outcome for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecovery {
    /// Recovered request
    pub request_id: RequestId,
    /// Minutes since the last stage event, or since `updated_at` without one
    pub stuck_minutes: i64,
    /// What the recovery did
    pub action: RecoveryAction,
}

/// Result of one health-check sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Sweep time
    pub timestamp: DateTime<Utc>,
    /// Verdict from the counters
    pub status: HealthStatus,
    /// In-progress requests listed
    pub examined: usize,
    /// Every request the sweep acted on
    pub recoveries: Vec<RequestRecovery>,
    /// Recoveries that ended in `blocked`
    pub blocked: usize,
    /// Completed stages whose request is gone from the store
    pub orphaned_deliverables: usize,
    /// Process liveness, empty when liveness checks are off
    pub processes: Vec<ProcessStatus>,
    /// Open tracker entries past their stage timeout after recovery
    pub stuck_stages: Vec<StuckWork>,
    /// Per-stage figures from the tracker
    pub stage_metrics: Vec<StageMetrics>,
    /// Set when the sweep itself malfunctioned
    pub error: Option<String>,
}

impl HealthReport {
    fn failed(timestamp: DateTime<Utc>, error: String) -> Self {
        Self {
            timestamp,
            status: HealthStatus::Critical,
            examined: 0,
            recoveries: Vec::new(),
            blocked: 0,
            orphaned_deliverables: 0,
            processes: Vec::new(),
            stuck_stages: Vec::new(),
            stage_metrics: Vec::new(),
            error: Some(error),
        }
    }

    /// Requests recovered to a schedulable state or done
    #[must_use]
    pub fn recovered(&self) -> usize {
        self.recoveries
            .iter()
            .filter(|r| !matches!(r.action, RecoveryAction::Blocked { .. }))
            .count()
    }
}

/// Verdict from the sweep counters
#[must_use]
pub fn verdict(blocked: usize, orphaned_deliverables: usize, config: &RecoveryConfig) -> HealthStatus {
    if blocked > config.blocked_critical_threshold {
        HealthStatus::Critical
    } else if blocked > 0 || orphaned_deliverables > config.orphaned_deliverables_threshold {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Periodic recovery of stuck in-progress work
pub struct RecoveryDaemon {
    store: Arc<dyn RequestStore>,
    bus: Arc<dyn MessageBus>,
    pipeline: Pipeline,
    config: RecoveryConfig,
    liveness: Option<Arc<dyn LivenessProbe>>,
    tracker: Option<SharedStageTracker>,
}

impl RecoveryDaemon {
    /// Create a daemon
    #[must_use]
    pub fn new(
        store: Arc<dyn RequestStore>,
        bus: Arc<dyn MessageBus>,
        pipeline: Pipeline,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            bus,
            pipeline,
            config,
            liveness: None,
            tracker: None,
        }
    }

    /// With liveness probe
    #[inline]
    #[must_use]
    pub fn with_liveness(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.liveness = Some(probe);
        self
    }

    /// With stage tracker for the stuck-work report
    #[inline]
    #[must_use]
    pub fn with_tracker(mut self, tracker: SharedStageTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Run one sweep now
    pub async fn check(&self) -> HealthReport {
        self.check_at(Utc::now()).await
    }

    /// Run one sweep as of `now` and broadcast the report
    pub async fn check_at(&self, now: DateTime<Utc>) -> HealthReport {
        let report = match self.sweep(now).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Recovery health check malfunctioned");
                HealthReport::failed(now, e.to_string())
            }
        };

        tracing::info!(
            status = %report.status,
            examined = report.examined,
            recovered = report.recovered(),
            blocked = report.blocked,
            orphaned_deliverables = report.orphaned_deliverables,
            "Recovery health check complete"
        );
        if let Err(e) = publish_json(self.bus.as_ref(), subjects::RESULTS, &report, None).await {
            tracing::warn!(error = %e, "Failed to broadcast health report");
        }
        report
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<HealthReport, RecoveryError> {
        let requests = self
            .store
            .list_requests(&RequestFilter::phase(Phase::InProgress))
            .await?;

        let mut recoveries = Vec::new();
        for request in &requests {
            if let Some(recovery) = self.recover_request(request, now).await {
                recoveries.push(recovery);
            }
        }
        let blocked = recoveries
            .iter()
            .filter(|r| matches!(r.action, RecoveryAction::Blocked { .. }))
            .count();

        let orphaned_deliverables = self.count_orphaned_deliverables().await;
        let processes = match &self.liveness {
            Some(probe) => probe.check().await,
            None => Vec::new(),
        };
        let (stuck_stages, stage_metrics) = match &self.tracker {
            Some(tracker) => {
                let tracker = tracker.lock();
                (tracker.find_stuck(now), tracker.metrics_at(now))
            }
            None => (Vec::new(), Vec::new()),
        };

        Ok(HealthReport {
            timestamp: now,
            status: verdict(blocked, orphaned_deliverables, &self.config),
            examined: requests.len(),
            recoveries,
            blocked,
            orphaned_deliverables,
            processes,
            stuck_stages,
            stage_metrics,
            error: None,
        })
    }

    /// Recover one request if stuck; any failure ends in `blocked`
    async fn recover_request(&self, request: &Request, now: DateTime<Utc>) -> Option<RequestRecovery> {
        let id = &request.id;
        let progress = match reconstruct(self.bus.as_ref(), &self.pipeline, id).await {
            Ok(p) => p,
            Err(e) => {
                let err = RecoveryError::Reconstruction {
                    id: id.clone(),
                    reason: e.to_string(),
                };
                return Some(self.block(request, now, &err).await);
            }
        };

        let last_activity = progress.last_activity().unwrap_or(request.updated_at);
        let stuck_for = now - last_activity;
        if stuck_for <= self.config.stuck_threshold() {
            return None;
        }
        let stuck_minutes = stuck_for.num_minutes();

        let (update, action) = match decide_resumption(&self.pipeline, &progress) {
            Resumption::Restart { first_stage, .. } => (
                StatusUpdate::reset(self.config.reschedule_phase),
                RecoveryAction::Rescheduled {
                    last_completed: None,
                    next_stage: first_stage,
                },
            ),
            Resumption::Resume {
                last_completed,
                next_stage,
                worker,
            } => (
                StatusUpdate {
                    assignment: Assignment::Set(worker),
                    ..StatusUpdate::to_phase(self.config.reschedule_phase)
                },
                RecoveryAction::Rescheduled {
                    last_completed: Some(last_completed),
                    next_stage,
                },
            ),
            Resumption::Complete => (StatusUpdate::to_phase(Phase::Done), RecoveryAction::Completed),
        };

        match self.store.update_request_status(id, update).await {
            Ok(_) => {
                self.release(id, now);
                tracing::info!(request_id = %id, stuck_minutes, action = ?action, "Recovered stuck request");
                Some(RequestRecovery {
                    request_id: id.clone(),
                    stuck_minutes,
                    action,
                })
            }
            Err(e) => Some(self.block(request, now, &RecoveryError::from(e)).await),
        }
    }

    async fn block(&self, request: &Request, now: DateTime<Utc>, error: &RecoveryError) -> RequestRecovery {
        let reason = format!("automatic recovery failed: {error}");
        self.release(&request.id, now);
        tracing::warn!(request_id = %request.id, error = %error, "Moving request to blocked");
        if let Err(e) = self
            .store
            .update_request_status(&request.id, StatusUpdate::blocked(reason.clone()))
            .await
        {
            tracing::error!(request_id = %request.id, error = %e, "Failed to mark request blocked");
        }
        RequestRecovery {
            request_id: request.id.clone(),
            stuck_minutes: (now - request.updated_at).num_minutes(),
            action: RecoveryAction::Blocked { reason },
        }
    }

    /// Close the request's open stage entry; it leaves in-progress either way
    fn release(&self, id: &RequestId, now: DateTime<Utc>) {
        if let Some(tracker) = &self.tracker {
            tracker.lock().close_request(id, now);
        }
    }

    /// Completion messages whose request no longer exists in the store
    async fn count_orphaned_deliverables(&self) -> usize {
        let history = match self.bus.history(subjects::STAGE_COMPLETED_ALL).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read completion history");
                return 0;
            }
        };
        let ids: BTreeSet<String> = history
            .iter()
            .filter_map(|m| m.subject.splitn(6, '.').nth(5).map(str::to_string))
            .collect();

        let mut orphaned = 0;
        for id in ids {
            match self.store.get_request(&RequestId::new(id)).await {
                Ok(None) => orphaned += 1,
                Ok(Some(_)) => {}
                Err(e) => tracing::debug!(error = %e, "Deliverable owner lookup failed"),
            }
        }
        orphaned
    }

    /// Sweep at startup, every interval, and on manual trigger
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut trigger = match self.bus.subscribe(subjects::RECOVERY_TRIGGER).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(error = %e, "Manual recovery trigger unavailable");
                None
            }
        };
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval().as_secs(), "Recovery daemon started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
                message = crate::next_trigger(&mut trigger) => {
                    if message.is_none() {
                        continue;
                    }
                    tracing::info!("Manual recovery trigger received");
                }
            }
            self.check().await;
        }
        tracing::info!("Recovery daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_thresholds() {
        let config = RecoveryConfig::default();
        assert_eq!(verdict(0, 0, &config), HealthStatus::Healthy);
        assert_eq!(verdict(1, 0, &config), HealthStatus::Degraded);
        assert_eq!(verdict(3, 0, &config), HealthStatus::Degraded);
        assert_eq!(verdict(4, 0, &config), HealthStatus::Critical);
        assert_eq!(verdict(0, 10, &config), HealthStatus::Healthy);
        assert_eq!(verdict(0, 11, &config), HealthStatus::Degraded);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HealthStatus::Critical).unwrap(), "\"critical\"");
    }
}
