//! Opaque audit workers
//!
//! The audit worker is a black box: it drains `audit.request` and eventually
//! publishes an `audit.response` carrying the same `auditRequestId`, or never
//! answers at all. [`WorkerBridge`] attaches any [`Worker`] to the bus as a
//! work-queue consumer; [`CommandWorker`] runs an external program per request.

use crate::bus::{publish_json, subjects, MessageBus};
use crate::config::WorkerCommandConfig;
use crate::error::WorkerError;
use crate::types::{AuditRequest, AuditResponse};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Work-queue group the audit consumers join
pub const AUDIT_WORKER_GROUP: &str = "audit-workers";

/// Something that turns an audit request into a response
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Handle one request; `Ok(None)` means the worker chose not to answer
    async fn handle(&self, request: AuditRequest) -> Result<Option<AuditResponse>, WorkerError>;
}

/// Connects a [`Worker`] to the audit work queue
pub struct WorkerBridge;

impl WorkerBridge {
    /// Consume `audit.request` until cancelled, publishing each response
    ///
    /// Requests are handled concurrently. Responses use the dedup key
    /// `{auditRequestId}-response` so a redelivered request never produces
    /// two responses.
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        worker: Arc<dyn Worker>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut requests = match bus
                .queue_subscribe(subjects::AUDIT_REQUEST, AUDIT_WORKER_GROUP)
                .await
            {
                Ok(sub) => sub,
                Err(e) => {
                    tracing::error!(error = %e, "Audit worker could not join the work queue");
                    return;
                }
            };
            tracing::info!("Audit worker bridge started");

            loop {
                let message = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    message = requests.next() => match message {
                        Some(m) => m,
                        None => break,
                    },
                };

                let request: AuditRequest = match message.json() {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, sequence = message.sequence, "Malformed audit request");
                        continue;
                    }
                };

                let bus = Arc::clone(&bus);
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    let id = request.audit_request_id.clone();
                    match worker.handle(request).await {
                        Ok(Some(response)) => {
                            let key = format!("{id}-response");
                            if let Err(e) =
                                publish_json(bus.as_ref(), subjects::AUDIT_RESPONSE, &response, Some(&key)).await
                            {
                                tracing::warn!(audit_id = %id, error = %e, "Failed to publish audit response");
                            }
                        }
                        Ok(None) => tracing::debug!(audit_id = %id, "Worker produced no response"),
                        Err(e) => tracing::warn!(audit_id = %id, error = %e, "Audit worker failed"),
                    }
                });
            }
            tracing::info!("Audit worker bridge stopped");
        })
    }
}

/// Runs an external program per audit request
///
/// The request is written to stdin as JSON; stdout must hold one JSON
/// response. A missing `auditRequestId` or `timestamp` is filled in from the
/// request.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandWorker {
    /// Create a worker running `program`
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(120 * 60),
        }
    }

    /// Create from configuration
    #[must_use]
    pub fn from_config(config: &WorkerCommandConfig) -> Self {
        Self::new(config.program.clone())
            .with_args(config.args.clone())
            .with_timeout(Duration::from_secs(config.timeout_minutes * 60))
    }

    /// With arguments
    #[inline]
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// With wall-clock limit per request
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn parse_output(stdout: &[u8], request: &AuditRequest) -> Result<AuditResponse, WorkerError> {
        let text = String::from_utf8_lossy(stdout);
        let body = text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .filter(|_| serde_json::from_str::<serde_json::Value>(text.trim()).is_err())
            .unwrap_or(text.trim());

        let mut value: serde_json::Value =
            serde_json::from_str(body).map_err(|e| WorkerError::InvalidOutput(e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| WorkerError::InvalidOutput("expected a JSON object".to_string()))?;
        object
            .entry("auditRequestId")
            .or_insert_with(|| request.audit_request_id.clone().into());
        object
            .entry("timestamp")
            .or_insert_with(|| chrono::Utc::now().to_rfc3339().into());

        serde_json::from_value(value).map_err(|e| WorkerError::InvalidOutput(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Worker for CommandWorker {
    async fn handle(&self, request: AuditRequest) -> Result<Option<AuditResponse>, WorkerError> {
        let input = serde_json::to_vec(&request).map_err(|e| WorkerError::InvalidOutput(e.to_string()))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| WorkerError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(WorkerError::Exited {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::parse_output(&output.stdout, &request).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::types::{AuditStatus, AuditType};
    use chrono::Utc;

    fn request(id: &str) -> AuditRequest {
        AuditRequest {
            audit_request_id: id.to_string(),
            audit_type: AuditType::full_system(),
            original_request_id: None,
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    struct Echo;

    #[async_trait::async_trait]
    impl Worker for Echo {
        async fn handle(&self, request: AuditRequest) -> Result<Option<AuditResponse>, WorkerError> {
            Ok(Some(AuditResponse {
                audit_request_id: request.audit_request_id,
                overall_status: AuditStatus::Pass,
                deployment_blocked: false,
                block_reasons: vec![],
                recommendations: vec![],
                timestamp: Utc::now(),
            }))
        }
    }

    #[test]
    fn parse_output_fills_missing_fields() {
        let out = br#"{"overall_status":"PASS"}"#;
        let response = CommandWorker::parse_output(out, &request("audit-7")).unwrap();
        assert_eq!(response.audit_request_id, "audit-7");
        assert_eq!(response.overall_status, AuditStatus::Pass);
    }

    #[test]
    fn parse_output_takes_last_line_after_logs() {
        let out = b"starting audit\nchecking things\n{\"overall_status\":\"FAIL\",\"deployment_blocked\":true}\n";
        let response = CommandWorker::parse_output(out, &request("audit-8")).unwrap();
        assert_eq!(response.overall_status, AuditStatus::Fail);
        assert!(response.deployment_blocked);
    }

    #[test]
    fn parse_output_rejects_garbage() {
        let err = CommandWorker::parse_output(b"not json", &request("x")).unwrap_err();
        assert!(matches!(err, WorkerError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn bridge_answers_requests() {
        let bus = Arc::new(InMemoryBus::new());
        let cancel = CancellationToken::new();
        bus.declare_work_queue(subjects::AUDIT_REQUEST);
        let mut responses = bus.subscribe(subjects::AUDIT_RESPONSE).await.unwrap();

        let handle = WorkerBridge::spawn(bus.clone(), Arc::new(Echo), cancel.clone());
        tokio::task::yield_now().await;

        publish_json(bus.as_ref(), subjects::AUDIT_REQUEST, &request("audit-1"), Some("audit-1"))
            .await
            .unwrap();

        let message = responses.next().await.unwrap();
        let response: AuditResponse = message.json().unwrap();
        assert_eq!(response.audit_request_id, "audit-1");
        assert_eq!(message.dedup_key.as_deref(), Some("audit-1-response"));

        cancel.cancel();
        handle.await.unwrap();
    }
}
