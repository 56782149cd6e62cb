//! NATS JetStream bus
//!
//! Durable subjects (stage lifecycle, audit traffic, results, escalations,
//! spawn requests) are captured by one JetStream stream, so progress history
//! and the audit work queue survive restarts of both Warden and its workers.
//! Triggers and liveness pings stay on core NATS.
//!
//! - Dedup keys travel as `Nats-Msg-Id` and are enforced by the stream's
//!   duplicate window
//! - Work queues are durable pull consumers, one per (group, subject)
//! - History is replayed through a short-lived ordered consumer

use crate::bus::{subject_matches, BusMessage, MessageBus, PublishAck, StreamInfo, Subscription};
use crate::config::BusConfig;
use crate::error::BusError;
use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::{self, consumer, stream};
use async_nats::{Client, ConnectOptions, HeaderMap};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Subjects persisted in the stream
pub const DURABLE_SUBJECTS: &[&str] = &[
    "pipeline.stage.>",
    "audit.request",
    "audit.response",
    "warden.results",
    "escalation.>",
    "worker.spawn",
];

/// Longest wait for the next replayed message before history gives up
const REPLAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether `subject` is captured by the stream
#[must_use]
pub fn is_durable(subject: &str) -> bool {
    DURABLE_SUBJECTS.iter().any(|pattern| subject_matches(pattern, subject))
}

/// Durable consumer name for a work-queue group on a subject
///
/// Consumer names may not contain subject separators or wildcards.
#[must_use]
pub fn consumer_name(group: &str, subject: &str) -> String {
    format!("{group}-{subject}")
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect()
}

fn request_error(err: impl std::fmt::Display) -> BusError {
    BusError::Request(err.to_string())
}

fn dedup_key(headers: Option<&HeaderMap>) -> Option<String> {
    headers
        .and_then(|h| h.get(NATS_MESSAGE_ID))
        .map(|v| v.as_str().to_string())
}

/// Client for a JetStream-enabled NATS server
#[derive(Debug, Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    stream: String,
}

impl NatsBus {
    /// Connect and make sure the stream exists
    ///
    /// # Errors
    /// - `BusError::Connect` when the credentials file cannot be read or the
    ///   server cannot be reached
    /// - `BusError::Request` when the stream cannot be created
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let connect_error = |reason: String| BusError::Connect {
            url: config.url.clone(),
            reason,
        };

        let options = match &config.credentials {
            Some(path) => ConnectOptions::with_credentials_file(path.clone())
                .await
                .map_err(|e| connect_error(format!("credentials {}: {e}", path.display())))?,
            None => ConnectOptions::new(),
        };
        let client = options
            .name("warden")
            .connect(config.url.as_str())
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        let jetstream = jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(stream::Config {
                name: config.stream.clone(),
                subjects: DURABLE_SUBJECTS.iter().map(|s| (*s).to_string()).collect(),
                max_messages: i64::try_from(config.max_history).unwrap_or(i64::MAX),
                duplicate_window: Duration::from_secs(config.dedup_window_secs),
                ..Default::default()
            })
            .await
            .map_err(request_error)?;

        tracing::info!(url = %config.url, stream = %config.stream, "Connected to message bus");
        Ok(Self {
            client,
            jetstream,
            stream: config.stream.clone(),
        })
    }

    async fn stream(&self) -> Result<stream::Stream, BusError> {
        self.jetstream.get_stream(&self.stream).await.map_err(request_error)
    }

    async fn work_queue(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<consumer::Consumer<consumer::pull::Config>, BusError> {
        let name = consumer_name(group, subject);
        self.stream()
            .await?
            .get_or_create_consumer(
                &name,
                consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(request_error)
    }

    /// Create the durable consumer for a work queue so its backlog is kept
    /// before any worker joins
    ///
    /// # Errors
    /// - `BusError::InvalidSubject` for subjects outside the stream
    /// - `BusError::Request` when the consumer cannot be created
    pub async fn declare_work_queue(&self, subject: &str, group: &str) -> Result<(), BusError> {
        if !is_durable(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }
        self.work_queue(subject, group).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl MessageBus for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: Option<&str>,
    ) -> Result<PublishAck, BusError> {
        let publish_error = |e: &dyn std::fmt::Display| BusError::PublishFailed {
            subject: subject.to_string(),
            reason: e.to_string(),
        };

        if !is_durable(subject) {
            self.client
                .publish(subject.to_string(), payload.into())
                .await
                .map_err(|e| publish_error(&e))?;
            return Ok(PublishAck {
                sequence: 0,
                duplicate: false,
            });
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = dedup_key {
            headers.insert(NATS_MESSAGE_ID, key);
        }
        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| publish_error(&e))?
            .await
            .map_err(|e| publish_error(&e))?;
        Ok(PublishAck {
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(request_error)?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    next = subscriber.next() => {
                        let Some(message) = next else { break };
                        let delivered = BusMessage {
                            subject: message.subject.to_string(),
                            dedup_key: dedup_key(message.headers.as_ref()),
                            payload: message.payload.to_vec(),
                            sequence: 0,
                            published_at: Utc::now(),
                        };
                        if tx.send(delivered).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = subscriber.unsubscribe().await;
        });
        Ok(Subscription::new(pattern, rx))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription, BusError> {
        if !is_durable(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }
        let mut messages = self
            .work_queue(subject, group)
            .await?
            .messages()
            .await
            .map_err(request_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = subject.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    next = messages.next() => match next {
                        None => break,
                        Some(Err(e)) => tracing::warn!(subject = %pattern, error = %e, "Work-queue delivery failed"),
                        Some(Ok(message)) => {
                            let (sequence, published_at) = match message.info() {
                                Ok(info) => (
                                    info.stream_sequence,
                                    DateTime::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond())
                                        .unwrap_or_else(Utc::now),
                                ),
                                Err(_) => (0, Utc::now()),
                            };
                            let delivered = BusMessage {
                                subject: message.message.subject.to_string(),
                                dedup_key: dedup_key(message.message.headers.as_ref()),
                                payload: message.message.payload.to_vec(),
                                sequence,
                                published_at,
                            };
                            // Unacked messages are redelivered to the next consumer
                            if tx.send(delivered).is_err() {
                                break;
                            }
                            if let Err(e) = message.ack().await {
                                tracing::warn!(subject = %pattern, sequence, error = %e, "Work-queue ack failed");
                            }
                        }
                    }
                }
            }
        });
        tracing::debug!(subject, group, "Work-queue consumer joined");
        Ok(Subscription::new(subject, rx))
    }

    async fn last_message(&self, subject: &str) -> Result<Option<BusMessage>, BusError> {
        if !is_durable(subject) {
            return Ok(None);
        }
        match self.stream().await?.get_last_raw_message_by_subject(subject).await {
            Ok(raw) => Ok(Some(BusMessage {
                subject: raw.subject.to_string(),
                dedup_key: dedup_key(Some(&raw.headers)),
                payload: raw.payload.to_vec(),
                sequence: raw.sequence,
                published_at: DateTime::from_timestamp(raw.time.unix_timestamp(), raw.time.nanosecond())
                    .unwrap_or_else(Utc::now),
            })),
            Err(e) if matches!(e.kind(), stream::LastRawMessageErrorKind::NoMessageFound) => Ok(None),
            Err(e) => Err(request_error(e)),
        }
    }

    async fn history(&self, pattern: &str) -> Result<Vec<BusMessage>, BusError> {
        let replay = self
            .stream()
            .await?
            .create_consumer(consumer::pull::OrderedConfig {
                filter_subject: pattern.to_string(),
                deliver_policy: consumer::DeliverPolicy::All,
                ..Default::default()
            })
            .await
            .map_err(request_error)?;
        let mut remaining = replay.cached_info().num_pending;
        let mut messages = replay.messages().await.map_err(request_error)?;

        let mut history = Vec::new();
        while remaining > 0 {
            let next = tokio::time::timeout(REPLAY_TIMEOUT, messages.next())
                .await
                .map_err(|_| BusError::Timeout(REPLAY_TIMEOUT))?;
            let Some(message) = next else { break };
            let message = message.map_err(request_error)?;
            let info = message.info().map_err(request_error)?;
            let sequence = info.stream_sequence;
            let published_at = DateTime::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond())
                .unwrap_or_else(Utc::now);
            remaining = info.pending;

            history.push(BusMessage {
                subject: message.message.subject.to_string(),
                dedup_key: dedup_key(message.message.headers.as_ref()),
                payload: message.message.payload.to_vec(),
                sequence,
                published_at,
            });
        }
        Ok(history)
    }

    async fn stream_info(&self, subject: &str) -> Result<StreamInfo, BusError> {
        let last_sequence = self.last_message(subject).await?.map_or(0, |m| m.sequence);
        let mut stream = self.stream().await?;
        let mut consumers = stream.consumers();

        let (mut pending, mut waiting) = (0u64, 0usize);
        while let Some(info) = consumers.next().await {
            let info = info.map_err(request_error)?;
            if info.config.filter_subject == subject {
                pending = pending.max(info.num_pending);
                waiting += info.num_waiting;
            }
        }
        Ok(StreamInfo {
            subject: subject.to_string(),
            pending,
            consumers: waiting,
            last_sequence,
        })
    }

    async fn ping(&self) -> Result<Duration, BusError> {
        let start = Instant::now();
        self.client.flush().await.map_err(|_| BusError::Disconnected)?;
        Ok(start.elapsed())
    }
}
