//! Senior audit daemon
//!
//! Orchestrates full-system audits over the bus:
//! - Publishes an audit request keyed by a unique id, awaits the correlated
//!   response under an adaptive timeout, warns early, retries with backoff
//! - On success persists the result, opens one ticket per recommendation,
//!   and requests a remediation worker for critical ones
//! - On exhaustion runs diagnostics, opens one escalation ticket plus
//!   remediation tickets, publishes a P0 escalation, and fails
//!
//! Triggers: startup, daily at the configured hour (UTC), and the manual
//! trigger subject. At most one audit is in flight.

use crate::correlation::Correlator;
use crate::diagnostics::{AuditDiagnostics, DiagnosticReport};
use crate::error::AuditError;
use crate::history::AuditHistory;
use crate::patterns::match_remediations;
use crate::tickets::{escalation_ticket, recommendation_ticket};
use crate::timeout::{RetryPolicy, TimeoutPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use warden_core::bus::subjects;
use warden_core::config::AuditConfig;
use warden_core::{
    publish_json, AuditRequest, AuditResponse, AuditResult, AuditType, MessageBus, Priority, RequestId,
    RequestStore, Severity,
};

/// Request for an immediate worker spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    /// Worker identity to start
    pub worker: String,
    /// Request the worker should pick up
    pub request_id: RequestId,
    /// Recommendation that prompted the spawn
    pub reason: String,
    /// When the spawn was requested
    pub requested_at: DateTime<Utc>,
}

/// P0 escalation broadcast
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    /// First attempt of the unanswered audit
    pub audit_request_id: String,
    /// Attempts made, retries included
    pub attempts: u32,
    /// Diagnostic severity at escalation
    pub severity: Severity,
    /// Diagnostic probable cause
    pub probable_cause: String,
    /// Escalation ticket, when the store accepted it
    pub ticket_id: Option<RequestId>,
    /// Diagnostics collected when the audit was given up
    pub report: DiagnosticReport,
}

/// Clears the single-flight flag on drop
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The senior audit daemon
pub struct SeniorAuditDaemon {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn RequestStore>,
    history: Option<Arc<dyn AuditHistory>>,
    diagnostics: Arc<AuditDiagnostics>,
    correlator: Arc<Correlator>,
    config: AuditConfig,
    timeouts: TimeoutPolicy,
    retries: RetryPolicy,
    in_progress: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SeniorAuditDaemon {
    /// Create a daemon
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn RequestStore>,
        diagnostics: Arc<AuditDiagnostics>,
        config: AuditConfig,
    ) -> Self {
        Self {
            bus,
            store,
            history: None,
            diagnostics,
            correlator: Arc::new(Correlator::new()),
            timeouts: TimeoutPolicy::from_config(&config),
            retries: RetryPolicy::from_config(&config),
            config,
            in_progress: AtomicBool::new(false),
            listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// With persisted history for adaptive timeouts
    #[inline]
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn AuditHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Pending audit correlation
    #[inline]
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Check if an audit is in flight
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Stop the response listener
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn ensure_listener(&self) -> Result<(), AuditError> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let handle = self
            .correlator
            .clone()
            .spawn_listener(self.bus.as_ref(), self.shutdown.child_token())
            .await?;
        *listener = Some(handle);
        Ok(())
    }

    /// Timeout for the next audit of `audit_type`
    pub async fn adaptive_timeout(&self, audit_type: &AuditType) -> Duration {
        let Some(history) = &self.history else {
            return self.timeouts.adaptive(None);
        };
        let since = Utc::now() - chrono::Duration::days(self.config.history_window_days);
        match history.average_duration(audit_type, since).await {
            Ok(average) => {
                let timeout = self.timeouts.adaptive_minutes(average);
                tracing::debug!(
                    audit_type = %audit_type,
                    average_minutes = ?average,
                    timeout_secs = timeout.as_secs(),
                    "Adaptive audit timeout"
                );
                timeout
            }
            Err(e) => {
                tracing::warn!(error = %e, "Audit history unavailable, using default timeout");
                self.timeouts.adaptive(None)
            }
        }
    }

    /// Run one audit to completion or escalation
    ///
    /// # Errors
    /// - `AuditError::AlreadyRunning` if another audit is in flight
    /// - `AuditError::Escalated` once every attempt has timed out
    /// - `AuditError::Shutdown` if the daemon was shut down
    /// - `AuditError::Bus` if the response subscription cannot be created
    pub async fn run_audit(&self, audit_type: AuditType) -> Result<AuditResult, AuditError> {
        if self.shutdown.is_cancelled() {
            return Err(AuditError::Shutdown);
        }
        if self.in_progress.swap(true, Ordering::AcqRel) {
            tracing::warn!(audit_type = %audit_type, "Audit already in flight, skipping");
            return Err(AuditError::AlreadyRunning);
        }
        let _flight = FlightGuard(&self.in_progress);

        self.ensure_listener().await?;
        let original_id = format!("audit-{}", uuid::Uuid::new_v4());
        let timeout = self.adaptive_timeout(&audit_type).await;
        let attempts = self.retries.total_attempts();
        tracing::info!(
            audit_id = %original_id,
            audit_type = %audit_type,
            timeout_secs = timeout.as_secs(),
            max_retries = self.retries.max_retries,
            "Starting audit"
        );

        for attempt in 0..attempts {
            let audit_id = if attempt == 0 {
                original_id.clone()
            } else {
                let delay = self.retries.delay_for(attempt);
                tracing::info!(
                    audit_id = %original_id,
                    retry = attempt,
                    delay_secs = delay.as_secs(),
                    "Retrying audit after backoff"
                );
                tokio::time::sleep(delay).await;
                format!("{original_id}-retry-{attempt}")
            };

            if let Some((response, elapsed)) = self
                .attempt(&audit_type, &audit_id, &original_id, attempt, timeout)
                .await
            {
                return Ok(self.complete(audit_type, response, elapsed).await);
            }
        }

        Err(self.escalate(&original_id, attempts).await)
    }

    /// One publish and wait; `None` on timeout or publish failure
    async fn attempt(
        &self,
        audit_type: &AuditType,
        audit_id: &str,
        original_id: &str,
        attempt: u32,
        timeout: Duration,
    ) -> Option<(AuditResponse, Duration)> {
        let mut response = self
            .correlator
            .register(audit_id, audit_type.clone(), original_id, attempt);
        let request = AuditRequest {
            audit_request_id: audit_id.to_string(),
            audit_type: audit_type.clone(),
            original_request_id: (attempt > 0).then(|| original_id.to_string()),
            attempt,
            timestamp: Utc::now(),
        };

        let started = Instant::now();
        if let Err(e) = publish_json(self.bus.as_ref(), subjects::AUDIT_REQUEST, &request, Some(audit_id)).await {
            tracing::error!(audit_id = %audit_id, error = %e, "Failed to publish audit request");
            self.correlator.remove(audit_id);
            return None;
        }

        let early_warning = self.config.early_warning();
        let warning = tokio::time::sleep(early_warning);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(warning, deadline);
        let mut warned = early_warning >= timeout;

        loop {
            tokio::select! {
                result = &mut response => {
                    return match result {
                        Ok(response) => Some((response, started.elapsed())),
                        Err(_) => {
                            tracing::warn!(audit_id = %audit_id, "Pending audit dropped before a response");
                            None
                        }
                    };
                }
                () = &mut warning, if !warned => {
                    warned = true;
                    tracing::warn!(
                        audit_id = %audit_id,
                        waited_secs = early_warning.as_secs(),
                        timeout_secs = timeout.as_secs(),
                        "Audit response is slow"
                    );
                }
                () = &mut deadline => {
                    self.correlator.remove(audit_id);
                    tracing::warn!(
                        audit_id = %audit_id,
                        attempt,
                        timeout_secs = timeout.as_secs(),
                        "Audit attempt timed out"
                    );
                    return None;
                }
            }
        }
    }

    async fn complete(&self, audit_type: AuditType, response: AuditResponse, elapsed: Duration) -> AuditResult {
        let result = AuditResult::from_response(audit_type, &response, elapsed);
        tracing::info!(
            audit_id = %response.audit_request_id,
            status = result.overall_status.as_str(),
            deployment_blocked = result.deployment_blocked,
            recommendations = result.recommendations.len(),
            duration_minutes = result.duration_minutes,
            "Audit completed"
        );

        if let Some(history) = &self.history {
            if let Err(e) = history.record(&result).await {
                tracing::warn!(error = %e, "Failed to persist audit result");
            }
        }

        for recommendation in &result.recommendations {
            let ticket = recommendation_ticket(recommendation, &self.config.remediation_worker);
            let critical = ticket.priority == Priority::Critical;
            match self.store.create_request(ticket).await {
                Ok(created) if critical => self.request_spawn(&created.id, recommendation).await,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to open recommendation ticket"),
            }
        }

        if let Err(e) = publish_json(self.bus.as_ref(), subjects::RESULTS, &result, None).await {
            tracing::warn!(error = %e, "Failed to broadcast audit result");
        }
        result
    }

    async fn request_spawn(&self, request_id: &RequestId, reason: &str) {
        let spawn = SpawnRequest {
            worker: self.config.remediation_worker.clone(),
            request_id: request_id.clone(),
            reason: reason.to_string(),
            requested_at: Utc::now(),
        };
        let dedup = format!("spawn-{request_id}");
        match publish_json(self.bus.as_ref(), subjects::SPAWN_REQUEST, &spawn, Some(&dedup)).await {
            Ok(_) => tracing::info!(request_id = %request_id, worker = %spawn.worker, "Requested remediation worker"),
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "Failed to request remediation worker"),
        }
    }

    async fn escalate(&self, audit_id: &str, attempts: u32) -> AuditError {
        tracing::error!(audit_id = %audit_id, attempts, "Audit retries exhausted, escalating");
        let report = self.diagnostics.diagnose(Some(audit_id)).await;

        let ticket = escalation_ticket(audit_id, attempts, &report, &self.config.operations_owner);
        let ticket_id = match self.store.create_request(ticket).await {
            Ok(created) => Some(created.id),
            Err(e) => {
                tracing::error!(error = %e, "Failed to open escalation ticket");
                None
            }
        };

        let texts = report
            .recommendations
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(report.probable_cause.as_str()));
        for remediation in match_remediations(texts) {
            if let Err(e) = self.store.create_request(remediation.to_request()).await {
                tracing::warn!(root_cause = remediation.root_cause, error = %e, "Failed to open remediation ticket");
            }
        }

        let escalation = Escalation {
            audit_request_id: audit_id.to_string(),
            attempts,
            severity: report.severity,
            probable_cause: report.probable_cause.clone(),
            ticket_id: ticket_id.clone(),
            report,
        };
        let dedup = format!("{audit_id}-escalation");
        if let Err(e) = publish_json(self.bus.as_ref(), subjects::ESCALATION_P0, &escalation, Some(&dedup)).await {
            tracing::error!(error = %e, "Failed to publish P0 escalation");
        }

        AuditError::Escalated {
            audit_id: audit_id.to_string(),
            attempts,
            ticket: ticket_id,
        }
    }

    async fn daily_scheduler(&self, tx: mpsc::Sender<()>) -> Result<JobScheduler, AuditError> {
        let schedule = format!("0 0 {} * * *", self.config.daily_hour);
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AuditError::Scheduler(e.to_string()))?;
        let job = Job::new_async(schedule.as_str(), move |_uuid, mut _l| {
            let tx = tx.clone();
            Box::pin(async move {
                // A full queue already holds a pending trigger.
                let _ = tx.try_send(());
            })
        })
        .map_err(|e| AuditError::Scheduler(e.to_string()))?;
        scheduler
            .add(job)
            .await
            .map_err(|e| AuditError::Scheduler(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| AuditError::Scheduler(e.to_string()))?;
        Ok(scheduler)
    }

    /// Run audits at startup, daily, and on manual trigger until cancelled
    ///
    /// # Errors
    /// - `AuditError::Escalated` when an audit escalates; the caller exits
    /// - `AuditError::Scheduler` if the daily trigger cannot be scheduled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), AuditError> {
        let (tx, mut daily) = mpsc::channel(1);
        let mut scheduler = self.daily_scheduler(tx).await?;
        let mut trigger = match self.bus.subscribe(subjects::AUDIT_TRIGGER).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(error = %e, "Manual audit trigger unavailable");
                None
            }
        };
        tracing::info!(daily_hour_utc = self.config.daily_hour, "Senior audit daemon started");

        let mut outcome = self.audit_once().await;
        while outcome.is_ok() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(()) = daily.recv() => tracing::info!("Daily audit trigger"),
                message = next_trigger(&mut trigger) => {
                    if message.is_none() {
                        continue;
                    }
                    tracing::info!("Manual audit trigger received");
                }
            }
            outcome = self.audit_once().await;
        }

        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "Scheduler shutdown failed");
        }
        if let Some(mut sub) = trigger.take() {
            sub.close();
        }
        self.shutdown().await;
        tracing::info!("Senior audit daemon stopped");
        outcome
    }

    /// One triggered audit; only escalation is fatal
    async fn audit_once(&self) -> Result<(), AuditError> {
        match self.run_audit(self.config.audit_type.clone()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Audit did not complete");
                Ok(())
            }
        }
    }
}

async fn next_trigger(subscription: &mut Option<warden_core::Subscription>) -> Option<warden_core::BusMessage> {
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
