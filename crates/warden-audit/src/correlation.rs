//! Audit request/response correlation
//!
//! Provides:
//! - [`PendingAudit`]: one in-flight round-trip, keyed by its audit id
//! - [`Correlator`]: explicit insert/remove map of pending audits, fed by the
//!   response subscription. Deadlines belong to the waiter; a timed-out
//!   attempt removes its own entry.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_core::bus::subjects;
use warden_core::{AuditResponse, AuditType, BusError, BusMessage, MessageBus, Subscription};

/// An audit awaiting its response
#[derive(Debug)]
pub struct PendingAudit {
    /// Id of this attempt
    pub audit_id: String,
    /// Audit type requested
    pub audit_type: AuditType,
    /// Id of the first attempt; retries count against it
    pub original_id: String,
    /// Zero-based retry number
    pub attempt: u32,
    /// When the attempt was registered
    pub started_at: Instant,
    resolver: oneshot::Sender<AuditResponse>,
}

/// Pending audits keyed by audit id
#[derive(Debug, Default)]
pub struct Correlator {
    pending: DashMap<String, PendingAudit>,
}

impl Correlator {
    /// Create an empty correlator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attempt before publishing it
    ///
    /// The receiver resolves when a response with the same id arrives.
    pub fn register(
        &self,
        audit_id: impl Into<String>,
        audit_type: AuditType,
        original_id: impl Into<String>,
        attempt: u32,
    ) -> oneshot::Receiver<AuditResponse> {
        let (tx, rx) = oneshot::channel();
        let audit_id = audit_id.into();
        let pending = PendingAudit {
            audit_id: audit_id.clone(),
            audit_type,
            original_id: original_id.into(),
            attempt,
            started_at: Instant::now(),
            resolver: tx,
        };
        if self.pending.insert(audit_id.clone(), pending).is_some() {
            tracing::warn!(audit_id = %audit_id, "Replaced pending audit with the same id");
        }
        rx
    }

    /// Deliver a response to its pending audit
    ///
    /// Returns `false` when the id is unknown; the response is logged and dropped.
    pub fn resolve(&self, response: AuditResponse) -> bool {
        let Some((_, pending)) = self.pending.remove(&response.audit_request_id) else {
            tracing::warn!(
                audit_id = %response.audit_request_id,
                "Dropping response for unknown audit"
            );
            return false;
        };
        tracing::debug!(
            audit_id = %pending.audit_id,
            original_id = %pending.original_id,
            attempt = pending.attempt,
            elapsed_ms = pending.started_at.elapsed().as_millis() as u64,
            "Audit response correlated"
        );
        // The waiter may have timed out and gone away.
        pending.resolver.send(response).is_ok()
    }

    /// Remove a pending audit without resolving it
    pub fn remove(&self, audit_id: &str) -> Option<PendingAudit> {
        self.pending.remove(audit_id).map(|(_, p)| p)
    }

    /// Check if an audit is pending
    #[must_use]
    pub fn contains(&self, audit_id: &str) -> bool {
        self.pending.contains_key(audit_id)
    }

    /// Number of pending audits
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Decode and resolve one bus message
    pub fn handle(&self, message: &BusMessage) -> bool {
        match message.json::<AuditResponse>() {
            Ok(response) => self.resolve(response),
            Err(e) => {
                tracing::warn!(subject = %message.subject, error = %e, "Undecodable audit response");
                false
            }
        }
    }

    /// Subscribe to audit responses and feed them in a background task
    ///
    /// The subscription exists when this returns, so no response published
    /// afterwards is missed.
    ///
    /// # Errors
    /// - `BusError` if the subscription cannot be created
    pub async fn spawn_listener(
        self: Arc<Self>,
        bus: &dyn MessageBus,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let subscription = bus.subscribe(subjects::AUDIT_RESPONSE).await?;
        Ok(tokio::spawn(self.listen(subscription, cancel)))
    }

    /// Feed responses from a subscription until cancelled
    pub async fn listen(self: Arc<Self>, mut subscription: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = subscription.next() => match message {
                    Some(message) => {
                        self.handle(&message);
                    }
                    None => {
                        tracing::warn!("Audit response subscription closed");
                        break;
                    }
                },
            }
        }
        subscription.close();
    }
}
