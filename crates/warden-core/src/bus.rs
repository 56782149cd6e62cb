//! Message bus seam and the in-process implementation
//!
//! The bus is an external collaborator: durable, at-least-once, deduplicated
//! by a caller-supplied key, with work-queue consumption for audit requests
//! and plain pub/sub for everything else. [`MessageBus`] is the boundary the
//! daemons depend on. [`crate::NatsBus`] implements it over JetStream;
//! [`InMemoryBus`] implements it for single-process deployments and tests.
//!
//! Subjects are dot-separated tokens. Patterns accept `*` (exactly one token)
//! and `>` (one or more trailing tokens).

use crate::error::BusError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Well-known subjects
pub mod subjects {
    /// Work-queue subject drained by the audit worker
    pub const AUDIT_REQUEST: &str = "audit.request";
    /// Responses correlated by audit id
    pub const AUDIT_RESPONSE: &str = "audit.response";
    /// Manual audit trigger
    pub const AUDIT_TRIGGER: &str = "audit.trigger";
    /// Audit results and health reports
    pub const RESULTS: &str = "warden.results";
    /// Highest-priority escalations
    pub const ESCALATION_P0: &str = "escalation.p0";
    /// Requests to spawn a worker immediately
    pub const SPAWN_REQUEST: &str = "worker.spawn";
    /// Manual recovery health-check trigger
    pub const RECOVERY_TRIGGER: &str = "recovery.trigger";
    /// Manual orphan sweep trigger
    pub const ORPHAN_TRIGGER: &str = "orphan.trigger";
    /// Liveness round-trip
    pub const PING: &str = "warden.ping";
    /// Every stage lifecycle event
    pub const STAGE_EVENTS: &str = "pipeline.stage.>";
    /// Every stage completion
    pub const STAGE_COMPLETED_ALL: &str = "pipeline.stage.completed.>";

    /// `pipeline.stage.completed.{worker}.{stage}.{request}`
    #[must_use]
    pub fn stage_completed(worker: &str, stage: &str, request_id: &str) -> String {
        format!("pipeline.stage.completed.{worker}.{stage}.{request_id}")
    }

    /// `pipeline.stage.entered.{worker}.{stage}.{request}`
    #[must_use]
    pub fn stage_entered(worker: &str, stage: &str, request_id: &str) -> String {
        format!("pipeline.stage.entered.{worker}.{stage}.{request_id}")
    }
}

/// A message as delivered or replayed from history
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Concrete subject the message was published on
    pub subject: String,
    /// Raw payload, usually JSON
    pub payload: Vec<u8>,
    /// Message id used for duplicate suppression
    pub dedup_key: Option<String>,
    /// Position in the subject's durable history; 0 for core messages
    pub sequence: u64,
    /// Server or publisher timestamp
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    /// Decode the JSON payload
    ///
    /// # Errors
    /// - `BusError::Codec` if the payload is not the expected JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Publish acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Sequence assigned to the message, or to the original on a duplicate
    pub sequence: u64,
    /// The dedup key was seen inside the window; nothing was delivered
    pub duplicate: bool,
}

/// Backlog and consumer count of one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Subject or wildcard the figures cover
    pub subject: String,
    /// Messages waiting for a work-queue consumer
    pub pending: u64,
    /// Live work-queue consumers
    pub consumers: usize,
    /// Highest sequence stored for the subject
    pub last_sequence: u64,
}

/// A live subscription
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Create from a pattern and receiver (for bus implementations)
    #[must_use]
    pub fn new(pattern: impl Into<String>, receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self {
            pattern: pattern.into(),
            receiver,
        }
    }

    /// Subscribed pattern
    #[inline]
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next message; `None` once the bus drops the subscription
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Unsubscribe
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Message bus boundary
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload; a repeated `dedup_key` inside the window is dropped
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, BusError>;

    /// Plain pub/sub subscription to a pattern
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;

    /// Work-queue subscription: each message goes to one member of `group`
    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription, BusError>;

    /// Most recent retained message on an exact subject
    async fn last_message(&self, subject: &str) -> Result<Option<BusMessage>, BusError>;

    /// Every retained message matching a pattern, oldest first
    async fn history(&self, pattern: &str) -> Result<Vec<BusMessage>, BusError>;

    /// Backlog and consumers of an exact subject
    async fn stream_info(&self, subject: &str) -> Result<StreamInfo, BusError>;

    /// Connectivity check returning round-trip latency
    async fn ping(&self) -> Result<Duration, BusError>;
}

/// Serialize `value` as JSON and publish it
///
/// # Errors
/// Codec or publish failures
pub async fn publish_json<T: Serialize + ?Sized>(
    bus: &dyn MessageBus,
    subject: &str,
    value: &T,
    dedup_key: Option<&str>,
) -> Result<PublishAck, BusError> {
    let payload = serde_json::to_vec(value)?;
    bus.publish(subject, payload, dedup_key).await
}

/// Check a subject against a pattern with `*` and `>` wildcards
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<(), BusError> {
    let bad_token = subject.split('.').any(|t| {
        t.is_empty() || t.contains(char::is_whitespace) || (!allow_wildcards && (t == "*" || t == ">"))
    });
    if subject.is_empty() || bad_token {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct WorkQueue {
    backlog: VecDeque<BusMessage>,
    members: Vec<mpsc::UnboundedSender<BusMessage>>,
    next: usize,
}

impl WorkQueue {
    fn prune(&mut self) {
        self.members.retain(|m| !m.is_closed());
    }

    /// Hand a message to the next live member, or keep it in the backlog
    fn offer(&mut self, mut message: BusMessage) {
        self.prune();
        while !self.members.is_empty() {
            let idx = self.next % self.members.len();
            self.next = self.next.wrapping_add(1);
            match self.members[idx].send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    message = returned;
                    self.members.remove(idx);
                }
            }
        }
        self.backlog.push_back(message);
    }

    fn drain_backlog(&mut self) {
        let pending: Vec<_> = self.backlog.drain(..).collect();
        for message in pending {
            self.offer(message);
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    sequence: u64,
    log: VecDeque<BusMessage>,
    dedup: HashMap<String, (u64, DateTime<Utc>)>,
    subscribers: Vec<(String, mpsc::UnboundedSender<BusMessage>)>,
    work_queues: HashMap<String, WorkQueue>,
}

/// In-process bus with history, dedup, and work queues
#[derive(Debug)]
pub struct InMemoryBus {
    state: Mutex<BusState>,
    connected: AtomicBool,
    dedup_window: chrono::Duration,
    max_history: usize,
}

impl InMemoryBus {
    /// Create a bus with the default dedup window and history size
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(Duration::from_secs(120), 100_000)
    }

    /// Create a bus with explicit limits
    #[must_use]
    pub fn with_limits(dedup_window: Duration, max_history: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            connected: AtomicBool::new(true),
            dedup_window: chrono::Duration::from_std(dedup_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(2)),
            max_history: max_history.max(1),
        }
    }

    /// Declare a work-queue subject so its backlog is retained before any consumer joins
    pub fn declare_work_queue(&self, subject: &str) {
        self.state
            .lock()
            .work_queues
            .entry(subject.to_string())
            .or_default();
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }

    /// Record a message with an explicit timestamp (history replay, tests)
    ///
    /// # Errors
    /// Same as [`MessageBus::publish`]
    pub fn publish_at(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<PublishAck, BusError> {
        self.ensure_connected()?;
        validate_subject(subject, false)?;

        let mut state = self.state.lock();
        if let Some(key) = dedup_key {
            let window = self.dedup_window;
            state.dedup.retain(|_, (_, seen)| at - *seen < window);
            if let Some((sequence, _)) = state.dedup.get(key) {
                return Ok(PublishAck {
                    sequence: *sequence,
                    duplicate: true,
                });
            }
        }

        state.sequence += 1;
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            dedup_key: dedup_key.map(str::to_string),
            sequence: state.sequence,
            published_at: at,
        };
        if let Some(key) = dedup_key {
            state.dedup.insert(key.to_string(), (message.sequence, at));
        }

        state.log.push_back(message.clone());
        while state.log.len() > self.max_history {
            state.log.pop_front();
        }

        state
            .subscribers
            .retain(|(pattern, tx)| !subject_matches(pattern, subject) || tx.send(message.clone()).is_ok());

        if let Some(queue) = state.work_queues.get_mut(subject) {
            queue.offer(message.clone());
        }

        Ok(PublishAck {
            sequence: message.sequence,
            duplicate: false,
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, BusError> {
        self.publish_at(subject, payload, dedup_key, Utc::now())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        self.ensure_connected()?;
        validate_subject(pattern, true)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push((pattern.to_string(), tx));
        Ok(Subscription::new(pattern, rx))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription, BusError> {
        self.ensure_connected()?;
        validate_subject(subject, false)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let queue = state.work_queues.entry(subject.to_string()).or_default();
        queue.members.push(tx);
        queue.drain_backlog();
        tracing::debug!(subject, group, consumers = queue.members.len(), "Work-queue consumer joined");
        Ok(Subscription::new(subject, rx))
    }

    async fn last_message(&self, subject: &str) -> Result<Option<BusMessage>, BusError> {
        self.ensure_connected()?;
        let state = self.state.lock();
        Ok(state.log.iter().rev().find(|m| m.subject == subject).cloned())
    }

    async fn history(&self, pattern: &str) -> Result<Vec<BusMessage>, BusError> {
        self.ensure_connected()?;
        validate_subject(pattern, true)?;
        let state = self.state.lock();
        Ok(state
            .log
            .iter()
            .filter(|m| subject_matches(pattern, &m.subject))
            .cloned()
            .collect())
    }

    async fn stream_info(&self, subject: &str) -> Result<StreamInfo, BusError> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        let last_sequence = state
            .log
            .iter()
            .rev()
            .find(|m| m.subject == subject)
            .map_or(0, |m| m.sequence);
        let (pending, consumers) = match state.work_queues.get_mut(subject) {
            Some(queue) => {
                queue.prune();
                (queue.backlog.len() as u64, queue.members.len())
            }
            None => (0, 0),
        };
        Ok(StreamInfo {
            subject: subject.to_string(),
            pending,
            consumers,
            last_sequence,
        })
    }

    async fn ping(&self) -> Result<Duration, BusError> {
        let start = Instant::now();
        self.ensure_connected()?;
        drop(self.state.lock());
        Ok(start.elapsed())
    }
}
