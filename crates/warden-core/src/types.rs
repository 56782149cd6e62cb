//! Core types for Warden
//!
//! Defines the fundamental types shared by every daemon:
//! - Requests, phases, and status updates against the external store
//! - Priorities and severities
//! - The audit request/response contract and persisted audit results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a request in the external store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Create a request id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle phase of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Backlog,
    Research,
    Review,
    Approved,
    InProgress,
    Blocked,
    Qa,
    Staging,
    Done,
    Cancelled,
}

impl Phase {
    /// Every phase, in lifecycle order
    pub const ALL: [Phase; 10] = [
        Phase::Backlog,
        Phase::Research,
        Phase::Review,
        Phase::Approved,
        Phase::InProgress,
        Phase::Blocked,
        Phase::Qa,
        Phase::Staging,
        Phase::Done,
        Phase::Cancelled,
    ];

    /// Wire name of the phase
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Backlog => "backlog",
            Phase::Research => "research",
            Phase::Review => "review",
            Phase::Approved => "approved",
            Phase::InProgress => "in_progress",
            Phase::Blocked => "blocked",
            Phase::Qa => "qa",
            Phase::Staging => "staging",
            Phase::Done => "done",
            Phase::Cancelled => "cancelled",
        }
    }

    /// Terminal phases are never touched by recovery
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// Ticket priority, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Parse a leading `CRITICAL:` / `HIGH:` / `MEDIUM:` / `LOW:` label.
    ///
    /// Returns the priority and the remaining text with the label stripped.
    #[must_use]
    pub fn from_label(text: &str) -> Option<(Priority, &str)> {
        let trimmed = text.trim_start();
        let (label, rest) = trimmed.split_once(':')?;
        let priority = match label.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Priority::Critical,
            "HIGH" => Priority::High,
            "MEDIUM" => Priority::Medium,
            "LOW" => Priority::Low,
            _ => return None,
        };
        Some((priority, rest.trim()))
    }

    /// Upper-case label used in recommendation text
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Diagnostic severity, ordered from lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Ticket priority matching this severity
    #[must_use]
    pub fn priority(self) -> Priority {
        match self {
            Severity::Low => Priority::Low,
            Severity::Medium => Priority::Medium,
            Severity::High => Priority::High,
            Severity::Critical => Priority::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A unit of multi-stage work, as stored by the external request store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Store identifier
    pub id: RequestId,
    /// Human-readable summary
    #[serde(default)]
    pub title: String,
    /// Lifecycle phase
    pub phase: Phase,
    /// Worker currently holding the request
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Last write in the store
    pub updated_at: DateTime<Utc>,
    /// Set while the request cannot proceed
    #[serde(default)]
    pub is_blocked: bool,
    /// Why the request is blocked, when `is_blocked`
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl Request {
    /// Create a request in the given phase, updated now
    #[must_use]
    pub fn new(id: impl Into<RequestId>, title: impl Into<String>, phase: Phase) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            phase,
            assigned_to: None,
            priority: Priority::default(),
            updated_at: Utc::now(),
            is_blocked: false,
            blocked_reason: None,
        }
    }

    /// With assigned worker
    #[inline]
    #[must_use]
    pub fn with_assignee(mut self, worker: impl Into<String>) -> Self {
        self.assigned_to = Some(worker.into());
        self
    }

    /// With last-updated timestamp
    #[inline]
    #[must_use]
    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    /// With priority
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Filter for listing requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    /// Only requests in this phase
    pub phase: Option<Phase>,
    /// Only requests held by this worker
    pub assigned_to: Option<String>,
}

impl RequestFilter {
    /// Match a single phase
    #[inline]
    #[must_use]
    pub fn phase(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            assigned_to: None,
        }
    }

    /// Check whether a request passes the filter
    #[must_use]
    pub fn matches(&self, request: &Request) -> bool {
        self.phase.map_or(true, |p| p == request.phase)
            && self
                .assigned_to
                .as_ref()
                .map_or(true, |a| request.assigned_to.as_ref() == Some(a))
    }
}

/// How a status update treats the assignment field
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Assignment {
    /// Leave the current assignee untouched
    #[default]
    Keep,
    /// Clear the assignee
    Clear,
    /// Assign to a worker
    Set(String),
}

/// Phase transition requested against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Target phase
    pub phase: Phase,
    /// Blocked flag to store
    pub is_blocked: bool,
    /// Stored with `is_blocked`; cleared otherwise
    pub blocked_reason: Option<String>,
    /// Assignee change
    pub assignment: Assignment,
}

impl StatusUpdate {
    /// Move to a phase, unblocked, keeping the assignee
    #[must_use]
    pub fn to_phase(phase: Phase) -> Self {
        Self {
            phase,
            is_blocked: false,
            blocked_reason: None,
            assignment: Assignment::Keep,
        }
    }

    /// Reset to a phase with the assignee cleared
    #[must_use]
    pub fn reset(phase: Phase) -> Self {
        Self {
            assignment: Assignment::Clear,
            ..Self::to_phase(phase)
        }
    }

    /// Move to `blocked` with a human-readable reason
    #[must_use]
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            phase: Phase::Blocked,
            is_blocked: true,
            blocked_reason: Some(reason.into()),
            assignment: Assignment::Keep,
        }
    }

    /// Apply this update to a request in place
    pub fn apply(&self, request: &mut Request, at: DateTime<Utc>) {
        request.phase = self.phase;
        request.is_blocked = self.is_blocked;
        request.blocked_reason.clone_from(&self.blocked_reason);
        match &self.assignment {
            Assignment::Keep => {}
            Assignment::Clear => request.assigned_to = None,
            Assignment::Set(worker) => request.assigned_to = Some(worker.clone()),
        }
        request.updated_at = at;
    }
}

/// A new request (ticket) to create in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequest {
    /// Ticket title
    pub title: String,
    /// Ticket body
    pub description: String,
    /// Initial phase
    pub phase: Phase,
    /// Scheduling priority
    pub priority: Priority,
    /// Initial assignee
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Free-form tags, e.g. `remediation`
    #[serde(default)]
    pub labels: Vec<String>,
}

impl NewRequest {
    /// Create a backlog ticket
    #[must_use]
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: Priority) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            phase: Phase::Backlog,
            priority,
            assigned_to: None,
            labels: Vec::new(),
        }
    }

    /// With assignee
    #[inline]
    #[must_use]
    pub fn assigned_to(mut self, owner: impl Into<String>) -> Self {
        self.assigned_to = Some(owner.into());
        self
    }

    /// With label
    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }
}

/// Kind of audit, used to key duration history
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditType(pub String);

impl AuditType {
    /// Create an audit type
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Full-system audit
    #[inline]
    #[must_use]
    pub fn full_system() -> Self {
        Self::new("full_system")
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Overall verdict of an audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    Pass,
    Warning,
    Fail,
}

impl AuditStatus {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Pass => "PASS",
            AuditStatus::Warning => "WARNING",
            AuditStatus::Fail => "FAIL",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(AuditStatus::Pass),
            "WARNING" => Ok(AuditStatus::Warning),
            "FAIL" => Ok(AuditStatus::Fail),
            other => Err(format!("unknown audit status: {other}")),
        }
    }
}

/// Audit request published onto the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRequest {
    /// Unique id of this attempt
    #[serde(rename = "auditRequestId")]
    pub audit_request_id: String,
    /// Scope of the audit
    #[serde(rename = "auditType")]
    pub audit_type: AuditType,
    /// Id of the first attempt this request retries, if any
    #[serde(rename = "originalRequestId", default)]
    pub original_request_id: Option<String>,
    /// Zero-based retry number
    #[serde(default)]
    pub attempt: u32,
    /// When the attempt was published
    pub timestamp: DateTime<Utc>,
}

/// Audit response produced by the opaque worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResponse {
    /// Id of the request being answered
    #[serde(rename = "auditRequestId")]
    pub audit_request_id: String,
    /// Pass, warning or fail
    pub overall_status: AuditStatus,
    /// Worker verdict that deployment must not proceed
    #[serde(default)]
    pub deployment_blocked: bool,
    /// Reasons behind `deployment_blocked`
    #[serde(default)]
    pub block_reasons: Vec<String>,
    /// Actions, optionally prefixed with a severity label
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// When the worker finished
    pub timestamp: DateTime<Utc>,
}

/// Persisted outcome of a completed audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    /// Scope of the audit
    pub audit_type: AuditType,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
    /// Measured request/response round trip
    pub duration_minutes: f64,
    /// Worker verdict
    pub overall_status: AuditStatus,
    /// Worker verdict that deployment must not proceed
    pub deployment_blocked: bool,
    /// Reasons behind `deployment_blocked`
    pub block_reasons: Vec<String>,
    /// Recommendations from the response
    pub recommendations: Vec<String>,
}

impl AuditResult {
    /// Build a result from a correlated response and the measured round-trip
    #[must_use]
    pub fn from_response(
        audit_type: AuditType,
        response: &AuditResponse,
        elapsed: std::time::Duration,
    ) -> Self {
        Self {
            audit_type,
            timestamp: response.timestamp,
            duration_minutes: elapsed.as_secs_f64() / 60.0,
            overall_status: response.overall_status,
            deployment_blocked: response.deployment_blocked,
            block_reasons: response.block_reasons.clone(),
            recommendations: response.recommendations.clone(),
        }
    }
}

/// Completion record a specialist worker publishes when a stage finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCompletion {
    /// Request the stage belongs to
    pub request_id: RequestId,
    /// Completed stage
    pub stage: String,
    /// Worker that finished the stage
    pub worker: String,
    /// When the stage finished
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_wire_name() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("paused".parse::<Phase>().is_err());
    }

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn priority_label_parsing() {
        assert_eq!(
            Priority::from_label("CRITICAL: restart the consumer"),
            Some((Priority::Critical, "restart the consumer"))
        );
        assert_eq!(
            Priority::from_label("low:tidy logs"),
            Some((Priority::Low, "tidy logs"))
        );
        assert_eq!(Priority::from_label("Restart: the consumer"), None);
        assert_eq!(Priority::from_label("no label here"), None);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert_eq!(Severity::High.priority(), Priority::High);
    }

    #[test]
    fn status_update_reset_clears_assignment() {
        let mut request = Request::new("REQ-1", "t", Phase::InProgress).with_assignee("backend");
        request.is_blocked = true;
        request.blocked_reason = Some("stale".into());

        let at = Utc::now();
        StatusUpdate::reset(Phase::Backlog).apply(&mut request, at);

        assert_eq!(request.phase, Phase::Backlog);
        assert_eq!(request.assigned_to, None);
        assert!(!request.is_blocked);
        assert_eq!(request.blocked_reason, None);
        assert_eq!(request.updated_at, at);
    }

    #[test]
    fn audit_response_wire_contract() {
        let json = r#"{
            "auditRequestId": "audit-1",
            "overall_status": "WARNING",
            "deployment_blocked": true,
            "block_reasons": ["flaky tests"],
            "recommendations": ["HIGH: fix tests"],
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;
        let response: AuditResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.audit_request_id, "audit-1");
        assert_eq!(response.overall_status, AuditStatus::Warning);
        assert!(response.deployment_blocked);
    }

    #[test]
    fn request_filter_matches() {
        let request = Request::new("REQ-1", "t", Phase::InProgress).with_assignee("qa");
        assert!(RequestFilter::phase(Phase::InProgress).matches(&request));
        assert!(!RequestFilter::phase(Phase::Done).matches(&request));
        assert!(RequestFilter::default().matches(&request));
    }
}
