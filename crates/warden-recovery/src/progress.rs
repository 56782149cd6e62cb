//! Progress reconstruction from bus history
//!
//! A request's progress is the longest prefix of the pipeline for which a
//! completion message exists on
//! `pipeline.stage.completed.{worker}.{stage}.{request}`. The first missing
//! stage ends the prefix, even if later stages have completions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use warden_core::bus::subjects;
use warden_core::{BusError, MessageBus, Pipeline, RequestId, StageCompletion};

/// One completed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageProgress {
    /// Completed stage
    pub stage: String,
    /// Worker that completed it
    pub worker: String,
    /// Completion time from the event
    pub completed_at: DateTime<Utc>,
}

/// Completed prefix of the pipeline for one request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Progress {
    /// Completions in pipeline order, stopping at the first gap
    pub completed: Vec<StageProgress>,
}

impl Progress {
    /// Last completed stage, if any
    #[must_use]
    pub fn last_completed(&self) -> Option<&StageProgress> {
        self.completed.last()
    }

    /// Most recent completion time
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.completed.iter().map(|s| s.completed_at).max()
    }
}

/// Where a stuck request should pick up again
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resumption {
    /// Nothing completed; start from the first stage
    Restart { first_stage: String, worker: String },
    /// Partial progress; continue at the stage after `last_completed`
    Resume {
        last_completed: String,
        next_stage: String,
        worker: String,
    },
    /// Every stage completed
    Complete,
}

/// Reconstruct the completed prefix of `request_id`
///
/// # Errors
/// Bus failures while reading history
pub async fn reconstruct(
    bus: &dyn MessageBus,
    pipeline: &Pipeline,
    request_id: &RequestId,
) -> Result<Progress, BusError> {
    let mut progress = Progress::default();
    for stage in pipeline.stages() {
        let subject = subjects::stage_completed(&stage.worker, &stage.name, request_id.as_str());
        let Some(message) = bus.last_message(&subject).await? else {
            break;
        };
        let completed_at = message
            .json::<StageCompletion>()
            .map_or(message.published_at, |c| c.completed_at);
        progress.completed.push(StageProgress {
            stage: stage.name.clone(),
            worker: stage.worker.clone(),
            completed_at,
        });
    }
    Ok(progress)
}

/// Decide where to resume given the completed prefix
#[must_use]
pub fn decide_resumption(pipeline: &Pipeline, progress: &Progress) -> Resumption {
    let Some(last) = progress.last_completed() else {
        return match pipeline.first() {
            Some(first) => Resumption::Restart {
                first_stage: first.name.clone(),
                worker: first.worker.clone(),
            },
            None => Resumption::Complete,
        };
    };
    match pipeline.next_stage(&last.stage) {
        Some(next) => Resumption::Resume {
            last_completed: last.stage.clone(),
            next_stage: next.name.clone(),
            worker: next.worker.clone(),
        },
        None => Resumption::Complete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::bus::publish_json;
    use warden_core::InMemoryBus;

    async fn complete(bus: &InMemoryBus, worker: &str, stage: &str, id: &str, at: DateTime<Utc>) {
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

    #[tokio::test]
    async fn stops_at_first_gap() {
        let bus = InMemoryBus::new();
        let pipeline = Pipeline::default();
        let t0 = Utc::now();
        complete(&bus, "researcher", "research", "REQ-1", t0).await;
        complete(&bus, "critic", "critique", "REQ-1", t0).await;
        // frontend without backend does not count
        complete(&bus, "frontend-developer", "frontend", "REQ-1", t0).await;

        let progress = reconstruct(&bus, &pipeline, &RequestId::new("REQ-1")).await.unwrap();
        let stages: Vec<_> = progress.completed.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, ["research", "critique"]);
        assert_eq!(
            decide_resumption(&pipeline, &progress),
            Resumption::Resume {
                last_completed: "critique".into(),
                next_stage: "backend".into(),
                worker: "backend-developer".into(),
            }
        );
    }

    #[tokio::test]
    async fn completion_time_comes_from_payload() {
        let bus = InMemoryBus::new();
        let at = Utc::now() - chrono::Duration::hours(3);
        complete(&bus, "researcher", "research", "REQ-2", at).await;
        let progress = reconstruct(&bus, &Pipeline::default(), &RequestId::new("REQ-2"))
            .await
            .unwrap();
        assert_eq!(progress.last_activity(), Some(at));
    }

    #[tokio::test]
    async fn foreign_payload_falls_back_to_publish_time() {
        let bus = InMemoryBus::new();
        bus.publish(&subjects::stage_completed("researcher", "research", "REQ-3"), b"done".to_vec(), None)
            .await
            .unwrap();
        let progress = reconstruct(&bus, &Pipeline::default(), &RequestId::new("REQ-3"))
            .await
            .unwrap();
        assert_eq!(progress.completed.len(), 1);
    }

    #[test]
    fn resumption_edges() {
        let pipeline = Pipeline::default();
        assert_eq!(
            decide_resumption(&pipeline, &Progress::default()),
            Resumption::Restart {
                first_stage: "research".into(),
                worker: "researcher".into(),
            }
        );

        let all = Progress {
            completed: pipeline
                .stages()
                .iter()
                .map(|s| StageProgress {
                    stage: s.name.clone(),
                    worker: s.worker.clone(),
                    completed_at: Utc::now(),
                })
                .collect(),
        };
        assert_eq!(decide_resumption(&pipeline, &all), Resumption::Complete);
    }
}
