//! Testing utilities for the Warden workspace
//!
//! Shared fixtures and fakes for the recovery and audit tests.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use warden_audit::{HostHealth, HostProbe};
use warden_core::bus::subjects;
use warden_core::{
    publish_json, AuditRequest, AuditResponse, AuditStatus, InMemoryRequestStore, MessageBus, NewRequest,
    Phase, Pipeline, Request, RequestFilter, RequestId, RequestStore, StageCompletion, StatusUpdate,
    StoreError, Worker, WorkerError,
};

/// An unassigned `in_progress` request last updated `updated_ago` ago
pub fn in_progress(id: &str, updated_ago: Duration) -> Request {
    Request::new(id, format!("Request {id}"), Phase::InProgress).with_updated_at(Utc::now() - updated_ago)
}

/// Publish one stage completion as a specialist worker would
pub async fn publish_completion(bus: &dyn MessageBus, worker: &str, stage: &str, id: &str, at: DateTime<Utc>) {
    let completion = StageCompletion {
        request_id: RequestId::new(id),
        stage: stage.to_string(),
        worker: worker.to_string(),
        completed_at: at,
    };
    publish_json(bus, &subjects::stage_completed(worker, stage, id), &completion, None)
        .await
        .unwrap();
}

/// Complete the first `n` pipeline stages of a request
pub async fn complete_stages(bus: &dyn MessageBus, pipeline: &Pipeline, id: &str, n: usize, at: DateTime<Utc>) {
    for stage in pipeline.stages().iter().take(n) {
        publish_completion(bus, &stage.worker, &stage.name, id, at).await;
    }
}

/// In-memory store that can be told to fail
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryRequestStore,
    rejected_phases: Mutex<HashSet<Phase>>,
    rejected_ids: Mutex<HashSet<RequestId>>,
    listing_fails: AtomicBool,
}

impl FlakyStore {
    pub fn new(requests: impl IntoIterator<Item = Request>) -> Self {
        Self {
            inner: InMemoryRequestStore::with_requests(requests),
            ..Self::default()
        }
    }

    /// Reject every update moving a request to `phase`
    pub fn reject_updates_to(&self, phase: Phase) {
        self.rejected_phases.lock().insert(phase);
    }

    /// Reject every update of `id`
    pub fn reject_updates_for(&self, id: &RequestId) {
        self.rejected_ids.lock().insert(id.clone());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.listing_fails.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryRequestStore {
        &self.inner
    }
}

#[async_trait::async_trait]
impl RequestStore for FlakyStore {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.list_requests(filter).await
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<Request>, StoreError> {
        self.inner.get_request(id).await
    }

    async fn update_request_status(&self, id: &RequestId, update: StatusUpdate) -> Result<Request, StoreError> {
        if self.rejected_ids.lock().contains(id) || self.rejected_phases.lock().contains(&update.phase) {
            return Err(StoreError::Rejected {
                id: id.clone(),
                reason: format!("transition to {} refused", update.phase.as_str()),
            });
        }
        self.inner.update_request_status(id, update).await
    }

    async fn create_request(&self, request: NewRequest) -> Result<Request, StoreError> {
        self.inner.create_request(request).await
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Respond,
    Delay(std::time::Duration),
    Never,
}

/// Fake audit worker: respond, delay, or never respond
#[derive(Debug)]
pub struct ScriptedWorker {
    reply: Reply,
    status: AuditStatus,
    recommendations: Vec<String>,
    silent_first: usize,
    calls: AtomicUsize,
    seen: Mutex<Vec<AuditRequest>>,
}

impl ScriptedWorker {
    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            status: AuditStatus::Pass,
            recommendations: Vec::new(),
            silent_first: 0,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn responding() -> Self {
        Self::with_reply(Reply::Respond)
    }

    pub fn delayed(delay: std::time::Duration) -> Self {
        Self::with_reply(Reply::Delay(delay))
    }

    pub fn never() -> Self {
        Self::with_reply(Reply::Never)
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_recommendations<S: Into<String>>(mut self, recommendations: impl IntoIterator<Item = S>) -> Self {
        self.recommendations = recommendations.into_iter().map(Into::into).collect();
        self
    }

    /// Ignore the first `n` requests
    pub fn silent_for(mut self, n: usize) -> Self {
        self.silent_first = n;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AuditRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait::async_trait]
impl Worker for ScriptedWorker {
    async fn handle(&self, request: AuditRequest) -> Result<Option<AuditResponse>, WorkerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        if call < self.silent_first {
            return Ok(None);
        }
        match &self.reply {
            Reply::Never => return Ok(None),
            Reply::Delay(delay) => tokio::time::sleep(*delay).await,
            Reply::Respond => {}
        }
        Ok(Some(AuditResponse {
            audit_request_id: request.audit_request_id,
            overall_status: self.status,
            deployment_blocked: self.status == AuditStatus::Fail,
            block_reasons: Vec::new(),
            recommendations: self.recommendations.clone(),
            timestamp: Utc::now(),
        }))
    }
}

/// Host probe returning a fixed snapshot
#[derive(Debug, Clone)]
pub struct FakeHostProbe(pub HostHealth);

impl FakeHostProbe {
    pub fn idle() -> Self {
        Self(HostHealth {
            cpu_percent: Some(12.0),
            memory_percent: Some(35.0),
            free_memory_mb: Some(8192),
            load_average: Some(0.5),
            cpu_cores: 4,
            uptime_secs: Some(86_400),
            error: None,
        })
    }
}

#[async_trait::async_trait]
impl HostProbe for FakeHostProbe {
    async fn probe(&self) -> HostHealth {
        self.0.clone()
    }
}
