//! In-memory stage ledger
//!
//! Tracks which stage each request currently occupies and for how long.
//! Entering a stage closes whatever entry the request had open, so a request
//! never holds more than one open entry. Closed entries go to a bounded
//! rolling history used for duration metrics. Nothing here is persisted.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use warden_core::{Pipeline, RequestId};

/// Tracker shared between the stage listener and the health check
pub type SharedStageTracker = Arc<Mutex<StageTracker>>;

/// One visit of a request to a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    /// Tracked request
    pub request_id: RequestId,
    /// Stage entered
    pub stage: String,
    /// When the stage was entered
    pub entered_at: DateTime<Utc>,
    /// Set when the entry is closed; never before `entered_at`
    pub exited_at: Option<DateTime<Utc>>,
    /// `exited_at - entered_at` once closed
    pub duration: Option<Duration>,
}

impl StageEntry {
    fn close(mut self, at: DateTime<Utc>) -> Self {
        let exited_at = at.max(self.entered_at);
        self.exited_at = Some(exited_at);
        self.duration = Some(exited_at - self.entered_at);
        self
    }
}

/// An open entry older than its stage timeout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckWork {
    /// Request with the open entry
    pub request_id: RequestId,
    /// Stage it is stuck in
    pub stage: String,
    /// Age of the open entry
    pub stuck_minutes: i64,
    /// Stage timeout the age was compared against
    pub expected_max_minutes: i64,
}

/// Per-stage occupancy and duration figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageMetrics {
    /// Stage name
    pub stage: String,
    /// Open entries in this stage
    pub in_progress: usize,
    /// Mean over closed entries in the rolling history; 0 when there are none
    pub avg_duration_minutes: f64,
    /// Longest closed entry in the rolling history
    pub max_duration_minutes: f64,
    /// Open entries past the stage timeout
    pub stuck: usize,
}

/// Stage ledger
#[derive(Debug)]
pub struct StageTracker {
    pipeline: Pipeline,
    open: HashMap<RequestId, StageEntry>,
    completed: VecDeque<StageEntry>,
    capacity: usize,
}

impl StageTracker {
    /// Create a tracker keeping up to `capacity` closed entries
    #[must_use]
    pub fn new(pipeline: Pipeline, capacity: usize) -> Self {
        Self {
            pipeline,
            open: HashMap::new(),
            completed: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Wrap in the shared handle
    #[must_use]
    pub fn shared(self) -> SharedStageTracker {
        Arc::new(Mutex::new(self))
    }

    /// Pipeline the tracker measures against
    #[inline]
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Open a new entry now
    pub fn enter_stage(&mut self, request_id: RequestId, stage: &str) -> Option<StageEntry> {
        self.enter_stage_at(request_id, stage, Utc::now())
    }

    /// Open a new entry at `at`, closing and returning any previous open entry
    pub fn enter_stage_at(
        &mut self,
        request_id: RequestId,
        stage: &str,
        at: DateTime<Utc>,
    ) -> Option<StageEntry> {
        let entry = StageEntry {
            request_id: request_id.clone(),
            stage: stage.to_string(),
            entered_at: at,
            exited_at: None,
            duration: None,
        };
        let previous = self.open.insert(request_id, entry)?;
        Some(self.archive(previous.close(at)))
    }

    /// Close the open entry now if it matches `stage`
    pub fn exit_stage(&mut self, request_id: &RequestId, stage: &str) -> Option<StageEntry> {
        self.exit_stage_at(request_id, stage, Utc::now())
    }

    /// Close the open entry at `at` if it matches `stage`; no-op otherwise
    pub fn exit_stage_at(
        &mut self,
        request_id: &RequestId,
        stage: &str,
        at: DateTime<Utc>,
    ) -> Option<StageEntry> {
        if self.open.get(request_id)?.stage != stage {
            return None;
        }
        let entry = self.open.remove(request_id)?;
        Some(self.archive(entry.close(at)))
    }

    /// Close whatever entry is open on completion or cancellation
    pub fn close_request(&mut self, request_id: &RequestId, at: DateTime<Utc>) -> Option<StageEntry> {
        let entry = self.open.remove(request_id)?;
        Some(self.archive(entry.close(at)))
    }

    fn archive(&mut self, entry: StageEntry) -> StageEntry {
        if self.completed.len() == self.capacity {
            self.completed.pop_front();
        }
        self.completed.push_back(entry.clone());
        entry
    }

    /// Stage after `stage` in the fixed order
    #[must_use]
    pub fn next_stage(&self, stage: &str) -> Option<&str> {
        self.pipeline.next_stage(stage).map(|s| s.name.as_str())
    }

    /// Open entry of a request
    #[must_use]
    pub fn open_entry(&self, request_id: &RequestId) -> Option<&StageEntry> {
        self.open.get(request_id)
    }

    /// Number of open entries
    #[inline]
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Closed entries, oldest first
    pub fn completed(&self) -> impl Iterator<Item = &StageEntry> {
        self.completed.iter()
    }

    /// Every open entry whose age exceeds its stage timeout, ordered by request id
    #[must_use]
    pub fn find_stuck(&self, now: DateTime<Utc>) -> Vec<StuckWork> {
        let mut stuck: Vec<_> = self
            .open
            .values()
            .filter_map(|entry| {
                let limit = self.pipeline.timeout_for(&entry.stage);
                let age = now - entry.entered_at;
                (age > limit).then(|| StuckWork {
                    request_id: entry.request_id.clone(),
                    stage: entry.stage.clone(),
                    stuck_minutes: age.num_minutes(),
                    expected_max_minutes: limit.num_minutes(),
                })
            })
            .collect();
        stuck.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        stuck
    }

    /// Metrics now
    #[must_use]
    pub fn metrics(&self) -> Vec<StageMetrics> {
        self.metrics_at(Utc::now())
    }

    /// Metrics for every pipeline stage, then any unmapped stage seen
    #[must_use]
    pub fn metrics_at(&self, now: DateTime<Utc>) -> Vec<StageMetrics> {
        let mut names: Vec<String> = self.pipeline.stages().iter().map(|s| s.name.clone()).collect();
        let mut extra: Vec<String> = self
            .open
            .values()
            .chain(self.completed.iter())
            .map(|e| e.stage.clone())
            .filter(|s| self.pipeline.stage(s).is_none())
            .collect();
        extra.sort();
        extra.dedup();
        names.extend(extra);

        let stuck = self.find_stuck(now);
        names
            .into_iter()
            .map(|stage| {
                let durations: Vec<f64> = self
                    .completed
                    .iter()
                    .filter(|e| e.stage == stage)
                    .filter_map(|e| e.duration)
                    .map(minutes_f64)
                    .collect();
                let avg = if durations.is_empty() {
                    0.0
                } else {
                    durations.iter().sum::<f64>() / durations.len() as f64
                };
                let max = durations.iter().copied().fold(0.0, f64::max);
                StageMetrics {
                    in_progress: self.open.values().filter(|e| e.stage == stage).count(),
                    avg_duration_minutes: avg,
                    max_duration_minutes: max,
                    stuck: stuck.iter().filter(|s| s.stage == stage).count(),
                    stage,
                }
            })
            .collect()
    }
}

fn minutes_f64(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 60_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StageTracker {
        StageTracker::new(Pipeline::default(), 10)
    }

    fn id(s: &str) -> RequestId {
        RequestId::new(s)
    }

    #[test]
    fn entering_closes_previous_entry() {
        let mut t = tracker();
        let t0 = Utc::now();
        assert!(t.enter_stage_at(id("REQ-1"), "research", t0).is_none());

        let closed = t
            .enter_stage_at(id("REQ-1"), "critique", t0 + Duration::minutes(12))
            .unwrap();
        assert_eq!(closed.stage, "research");
        assert_eq!(closed.duration, Some(Duration::minutes(12)));
        assert_eq!(t.open_count(), 1);
        assert_eq!(t.open_entry(&id("REQ-1")).unwrap().stage, "critique");
    }

    #[test]
    fn exit_of_other_stage_is_noop() {
        let mut t = tracker();
        let t0 = Utc::now();
        t.enter_stage_at(id("REQ-1"), "backend", t0);
        assert!(t.exit_stage_at(&id("REQ-1"), "frontend", t0).is_none());
        assert!(t.exit_stage_at(&id("REQ-2"), "backend", t0).is_none());
        assert_eq!(t.open_count(), 1);

        let closed = t.exit_stage_at(&id("REQ-1"), "backend", t0 + Duration::minutes(5));
        assert!(closed.is_some());
        assert_eq!(t.open_count(), 0);
    }

    #[test]
    fn exit_before_entry_clamps_duration() {
        let mut t = tracker();
        let t0 = Utc::now();
        t.enter_stage_at(id("REQ-1"), "qa", t0);
        let closed = t.exit_stage_at(&id("REQ-1"), "qa", t0 - Duration::minutes(3)).unwrap();
        assert_eq!(closed.exited_at, Some(t0));
        assert_eq!(closed.duration, Some(Duration::zero()));
    }

    #[test]
    fn find_stuck_uses_stage_timeouts() {
        let mut t = tracker();
        let now = Utc::now();
        // research limit 30m, backend 60m, unmapped defaults to 60m
        t.enter_stage_at(id("REQ-1"), "research", now - Duration::minutes(31));
        t.enter_stage_at(id("REQ-2"), "backend", now - Duration::minutes(31));
        t.enter_stage_at(id("REQ-3"), "triage", now - Duration::minutes(61));

        let stuck = t.find_stuck(now);
        let ids: Vec<_> = stuck.iter().map(|s| s.request_id.as_str()).collect();
        assert_eq!(ids, ["REQ-1", "REQ-3"]);
        assert_eq!(stuck[0].stuck_minutes, 31);
        assert_eq!(stuck[0].expected_max_minutes, 30);
    }

    #[test]
    fn history_is_bounded() {
        let mut t = StageTracker::new(Pipeline::default(), 2);
        let t0 = Utc::now();
        for i in 0..5 {
            let rid = id(&format!("REQ-{i}"));
            t.enter_stage_at(rid.clone(), "qa", t0);
            t.close_request(&rid, t0 + Duration::minutes(i));
        }
        assert_eq!(t.completed().count(), 2);
    }

    #[test]
    fn metrics_report_occupancy_and_durations() {
        let mut t = tracker();
        let t0 = Utc::now();
        t.enter_stage_at(id("REQ-1"), "qa", t0 - Duration::minutes(100));
        t.exit_stage_at(&id("REQ-1"), "qa", t0 - Duration::minutes(90));
        t.enter_stage_at(id("REQ-2"), "qa", t0 - Duration::minutes(80));
        t.exit_stage_at(&id("REQ-2"), "qa", t0 - Duration::minutes(50));
        t.enter_stage_at(id("REQ-3"), "qa", t0 - Duration::minutes(46));

        let metrics = t.metrics_at(t0);
        let qa = metrics.iter().find(|m| m.stage == "qa").unwrap();
        assert_eq!(qa.in_progress, 1);
        assert!((qa.avg_duration_minutes - 20.0).abs() < 1e-9);
        assert!((qa.max_duration_minutes - 30.0).abs() < 1e-9);
        assert_eq!(qa.stuck, 1);
        assert_eq!(metrics.len(), 6);
    }

    #[test]
    fn next_stage_delegates_to_pipeline() {
        let t = tracker();
        assert_eq!(t.next_stage("research"), Some("critique"));
        assert_eq!(t.next_stage("statistics"), None);
    }
}
