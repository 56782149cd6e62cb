//! Orphan detection and recovery
//!
//! An in-progress request is orphaned when nothing verifiable has happened
//! to it within the threshold:
//! - it has no assigned worker and `updated_at` is stale, or
//! - its tracked activity clock is stale, or
//! - no activity is tracked and `updated_at` is stale.
//!
//! Recovery puts it back in the backlog with the assignment and blocked
//! reason cleared. Sweeps are idempotent: a recovered request is no longer
//! in progress, so a repeated sweep finds nothing.

use crate::error::RecoveryError;
use crate::stage_tracker::SharedStageTracker;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warden_core::bus::subjects;
use warden_core::config::OrphanConfig;
use warden_core::{
    MessageBus, Phase, Request, RequestFilter, RequestId, RequestStore, StatusUpdate, StoreError,
};

/// Which orphan rule matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    /// No assigned worker and not updated within the threshold
    Unassigned,
    /// Tracked activity older than the threshold
    StaleActivity,
    /// Nothing tracked and not updated within the threshold
    NoActivity,
}

/// An in-progress request with no verifiable recent activity or owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedWorkflow {
    /// Orphaned request
    pub request_id: RequestId,
    /// Request title, for reports
    pub title: String,
    /// Worker holding the request, if any
    pub assigned_to: Option<String>,
    /// Tracked activity clock at classification
    pub last_activity: Option<DateTime<Utc>>,
    /// Minutes since the timestamp that made the request stale
    pub stuck_minutes: i64,
    /// Rule that matched
    pub reason: OrphanReason,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// In-progress requests listed
    pub examined: usize,
    /// Requests matching an orphan rule
    pub orphans: Vec<OrphanedWorkflow>,
    /// Orphans returned to the backlog
    pub recovered: Vec<RequestId>,
    /// Orphans whose reset failed, with the store error
    pub failed: Vec<(RequestId, String)>,
}

/// Finds abandoned in-progress requests and returns them to the backlog
pub struct OrphanDetector {
    store: Arc<dyn RequestStore>,
    activity: DashMap<RequestId, DateTime<Utc>>,
    tracker: Option<SharedStageTracker>,
    threshold: Duration,
    interval: std::time::Duration,
}

impl OrphanDetector {
    /// Create a detector with the default threshold and interval
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self::from_config(store, &OrphanConfig::default())
    }

    /// Create a detector from configuration
    #[must_use]
    pub fn from_config(store: Arc<dyn RequestStore>, config: &OrphanConfig) -> Self {
        Self {
            store,
            activity: DashMap::new(),
            tracker: None,
            threshold: config.threshold(),
            interval: config.sweep_interval(),
        }
    }

    /// With orphan threshold
    #[inline]
    #[must_use]
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// With sweep interval
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Close a recovered request's open stage entry in the shared tracker
    #[inline]
    #[must_use]
    pub fn with_tracker(mut self, tracker: SharedStageTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Refresh the activity clock now
    pub fn record_activity(&self, request_id: &RequestId) {
        self.record_activity_at(request_id, Utc::now());
    }

    /// Refresh the activity clock; never moves it backwards
    pub fn record_activity_at(&self, request_id: &RequestId, at: DateTime<Utc>) {
        self.activity
            .entry(request_id.clone())
            .and_modify(|t| *t = (*t).max(at))
            .or_insert(at);
    }

    /// Tracked activity of a request
    #[must_use]
    pub fn last_activity(&self, request_id: &RequestId) -> Option<DateTime<Utc>> {
        self.activity.get(request_id).map(|t| *t)
    }

    /// Apply the orphan rules to one request
    #[must_use]
    pub fn classify(&self, request: &Request, now: DateTime<Utc>) -> Option<OrphanedWorkflow> {
        if request.phase != Phase::InProgress {
            return None;
        }
        let stale = |t: DateTime<Utc>| now - t > self.threshold;
        let activity = self.last_activity(&request.id);

        let (reason, since) = if request.assigned_to.is_none() && stale(request.updated_at) {
            (OrphanReason::Unassigned, request.updated_at)
        } else {
            match activity {
                Some(t) if stale(t) => (OrphanReason::StaleActivity, t),
                None if stale(request.updated_at) => (OrphanReason::NoActivity, request.updated_at),
                _ => return None,
            }
        };

        Some(OrphanedWorkflow {
            request_id: request.id.clone(),
            title: request.title.clone(),
            assigned_to: request.assigned_to.clone(),
            last_activity: activity,
            stuck_minutes: (now - since).num_minutes(),
            reason,
        })
    }

    /// List in-progress requests and classify them
    ///
    /// # Errors
    /// Store failures while listing
    pub async fn find_orphans(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, Vec<OrphanedWorkflow>), StoreError> {
        let requests = self
            .store
            .list_requests(&RequestFilter::phase(Phase::InProgress))
            .await?;
        let orphans = requests.iter().filter_map(|r| self.classify(r, now)).collect();
        Ok((requests.len(), orphans))
    }

    /// Sweep now
    ///
    /// # Errors
    /// Store failures while listing
    pub async fn sweep(&self) -> Result<SweepReport, RecoveryError> {
        self.sweep_at(Utc::now()).await
    }

    /// Find and recover every orphan as of `now`
    ///
    /// A failure on one orphan is recorded and does not stop the sweep.
    ///
    /// # Errors
    /// Store failures while listing
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, RecoveryError> {
        let (examined, orphans) = self.find_orphans(now).await?;
        let mut report = SweepReport {
            examined,
            ..SweepReport::default()
        };

        for orphan in &orphans {
            match self
                .store
                .update_request_status(&orphan.request_id, StatusUpdate::reset(Phase::Backlog))
                .await
            {
                Ok(_) => {
                    self.activity.remove(&orphan.request_id);
                    if let Some(tracker) = &self.tracker {
                        tracker.lock().close_request(&orphan.request_id, now);
                    }
                    tracing::info!(
                        request_id = %orphan.request_id,
                        reason = ?orphan.reason,
                        stuck_minutes = orphan.stuck_minutes,
                        "Orphaned request returned to backlog"
                    );
                    report.recovered.push(orphan.request_id.clone());
                }
                Err(e) => {
                    tracing::warn!(request_id = %orphan.request_id, error = %e, "Orphan recovery failed");
                    report.failed.push((orphan.request_id.clone(), e.to_string()));
                }
            }
        }
        report.orphans = orphans;
        Ok(report)
    }

    /// Sweep at startup, then on every interval tick or manual trigger
    pub async fn run(self: Arc<Self>, bus: Option<Arc<dyn MessageBus>>, cancel: CancellationToken) {
        let mut trigger = match &bus {
            Some(bus) => match bus.subscribe(subjects::ORPHAN_TRIGGER).await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(error = %e, "Manual orphan trigger unavailable");
                    None
                }
            },
            None => None,
        };

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            threshold_minutes = self.threshold.num_minutes(),
            interval_secs = self.interval.as_secs(),
            "Orphan detector started"
        );

        loop {
            let source = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => "interval",
                message = crate::next_trigger(&mut trigger) => match message {
                    Some(_) => "manual",
                    None => continue,
                },
            };

            match self.sweep().await {
                Ok(report) => tracing::info!(
                    trigger = source,
                    examined = report.examined,
                    orphans = report.orphans.len(),
                    recovered = report.recovered.len(),
                    failed = report.failed.len(),
                    "Orphan sweep complete"
                ),
                Err(e) => tracing::error!(trigger = source, error = %e, "Orphan sweep failed"),
            }
        }
        tracing::info!("Orphan detector stopped");
    }
}
