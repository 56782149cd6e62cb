//! Stage event listener
//!
//! Subscribes to `pipeline.stage.>` and feeds entries and completions into
//! the stage tracker and the orphan detector's activity clocks.

use crate::orphan::OrphanDetector;
use crate::stage_tracker::SharedStageTracker;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warden_core::bus::subjects;
use warden_core::{BusError, BusMessage, MessageBus, RequestId, StageCompletion};

/// Kind of stage lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEventKind {
    Entered,
    Completed,
}

/// A parsed `pipeline.stage.{kind}.{worker}.{stage}.{request}` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    /// Entered or completed
    pub kind: StageEventKind,
    /// Publishing worker
    pub worker: String,
    /// Stage name
    pub stage: String,
    /// Request the event is about
    pub request_id: RequestId,
    /// Publish time of the event
    pub at: DateTime<Utc>,
}

impl StageEvent {
    /// Parse a bus message; `None` for subjects outside the stage namespace
    #[must_use]
    pub fn parse(message: &BusMessage) -> Option<Self> {
        let mut tokens = message.subject.splitn(6, '.');
        if tokens.next()? != "pipeline" || tokens.next()? != "stage" {
            return None;
        }
        let kind = match tokens.next()? {
            "entered" => StageEventKind::Entered,
            "completed" => StageEventKind::Completed,
            _ => return None,
        };
        let worker = tokens.next()?.to_string();
        let stage = tokens.next()?.to_string();
        let request_id = RequestId::new(tokens.next()?);
        let at = match kind {
            StageEventKind::Completed => message
                .json::<StageCompletion>()
                .map_or(message.published_at, |c| c.completed_at),
            StageEventKind::Entered => message.published_at,
        };
        Some(Self {
            kind,
            worker,
            stage,
            request_id,
            at,
        })
    }
}

/// Feeds stage events into the tracker and activity clocks
pub struct StageEventListener {
    tracker: Option<SharedStageTracker>,
    orphans: Option<Arc<OrphanDetector>>,
}

impl StageEventListener {
    /// Create a listener with nothing wired in
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracker: None,
            orphans: None,
        }
    }

    /// With stage tracker
    #[inline]
    #[must_use]
    pub fn with_tracker(mut self, tracker: SharedStageTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// With orphan detector
    #[inline]
    #[must_use]
    pub fn with_orphan_detector(mut self, orphans: Arc<OrphanDetector>) -> Self {
        self.orphans = Some(orphans);
        self
    }

    /// Apply one message; returns the parsed event
    pub fn handle(&self, message: &BusMessage) -> Option<StageEvent> {
        let event = StageEvent::parse(message)?;
        if let Some(tracker) = &self.tracker {
            let mut tracker = tracker.lock();
            match event.kind {
                StageEventKind::Entered => {
                    tracker.enter_stage_at(event.request_id.clone(), &event.stage, event.at);
                }
                StageEventKind::Completed => {
                    tracker.exit_stage_at(&event.request_id, &event.stage, event.at);
                }
            }
        }
        if let Some(orphans) = &self.orphans {
            orphans.record_activity_at(&event.request_id, event.at);
        }
        tracing::debug!(
            request_id = %event.request_id,
            stage = %event.stage,
            worker = %event.worker,
            kind = ?event.kind,
            "Stage event"
        );
        Some(event)
    }

    /// Consume stage events until cancelled
    ///
    /// # Errors
    /// - `BusError` if the subscription cannot be created
    pub async fn run(self, bus: Arc<dyn MessageBus>, cancel: CancellationToken) -> Result<(), BusError> {
        let mut events = bus.subscribe(subjects::STAGE_EVENTS).await?;
        tracing::info!("Stage event listener started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = events.next() => match message {
                    Some(m) => {
                        self.handle(&m);
                    }
                    None => break,
                },
            }
        }
        tracing::info!("Stage event listener stopped");
        Ok(())
    }
}

impl Default for StageEventListener {
    fn default() -> Self {
        Self::new()
    }
}
