//! The fixed, ordered stage pipeline
//!
//! Stage order never changes at runtime. Each stage names the worker identity
//! that publishes its completions and carries its own stuck-work timeout.

use crate::config::PipelineConfig;
use chrono::Duration;

/// One stage of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStage {
    /// Stage name as it appears in subjects
    pub name: String,
    /// Specialist worker that owns the stage
    pub worker: String,
    /// Time after which an open stage counts as stuck
    pub timeout: Duration,
}

/// Ordered stages plus the default timeout for unmapped stage names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
    default_timeout: Duration,
}

impl Pipeline {
    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let default_timeout = minutes(config.default_stage_timeout_minutes);
        let stages = config
            .stages
            .iter()
            .map(|s| PipelineStage {
                name: s.name.clone(),
                worker: s.worker.clone(),
                timeout: s.timeout_minutes.map_or(default_timeout, minutes),
            })
            .collect();
        Self {
            stages,
            default_timeout,
        }
    }

    /// Stages in order
    #[inline]
    #[must_use]
    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    /// First stage
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<&PipelineStage> {
        self.stages.first()
    }

    /// Last stage
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&PipelineStage> {
        self.stages.last()
    }

    /// Number of stages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when the pipeline has no stages
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Look up a stage by name
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Position of a stage in the order
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Stage immediately after `name`; `None` if terminal or unknown
    #[must_use]
    pub fn next_stage(&self, name: &str) -> Option<&PipelineStage> {
        self.position(name).and_then(|i| self.stages.get(i + 1))
    }

    /// Timeout of a stage, falling back to the default for unmapped names
    #[must_use]
    pub fn timeout_for(&self, name: &str) -> Duration {
        self.stage(name).map_or(self.default_timeout, |s| s.timeout)
    }

    /// Override the timeout of one stage
    pub fn set_timeout(&mut self, name: &str, timeout: Duration) {
        if let Some(stage) = self.stages.iter_mut().find(|s| s.name == name) {
            stage.timeout = timeout;
        }
    }

    /// Default timeout for stages not in the pipeline
    #[inline]
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

fn minutes(value: u64) -> Duration {
    Duration::minutes(i64::try_from(value).unwrap_or(i64::MAX / 60_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order() {
        let pipeline = Pipeline::default();
        let names: Vec<_> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["research", "critique", "backend", "frontend", "qa", "statistics"]
        );
    }

    #[test]
    fn next_stage_follows_order() {
        let pipeline = Pipeline::default();
        assert_eq!(pipeline.next_stage("critique").unwrap().name, "backend");
        assert!(pipeline.next_stage("statistics").is_none());
        assert!(pipeline.next_stage("deploy").is_none());
    }

    #[test]
    fn unmapped_stage_uses_default_timeout() {
        let pipeline = Pipeline::default();
        assert_eq!(pipeline.timeout_for("backend"), Duration::minutes(60));
        assert_eq!(pipeline.timeout_for("research"), Duration::minutes(30));
        assert_eq!(pipeline.timeout_for("triage"), pipeline.default_timeout());
    }

    #[test]
    fn set_timeout_overrides_one_stage() {
        let mut pipeline = Pipeline::default();
        pipeline.set_timeout("qa", Duration::minutes(5));
        assert_eq!(pipeline.timeout_for("qa"), Duration::minutes(5));
        assert_eq!(pipeline.timeout_for("frontend"), Duration::minutes(60));
    }
}
