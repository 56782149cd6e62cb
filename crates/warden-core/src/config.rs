//! Warden configuration
//!
//! A single validated struct enumerating every recognized option. Every field
//! has a default; values come from an optional TOML file and are then
//! overridden by `WARDEN_*` environment variables. [`WardenConfig::validate`]
//! runs once at startup and fails fast on inconsistent settings.

use crate::error::ConfigError;
use crate::types::{AuditType, Phase};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Message bus connection
    pub bus: BusConfig,
    /// Request store client
    pub store: StoreConfig,
    /// Audit history database
    pub database: DatabaseConfig,
    /// Stage order and timeouts
    pub pipeline: PipelineConfig,
    /// Orphan detector
    pub orphan: OrphanConfig,
    /// Recovery health check
    pub recovery: RecoveryConfig,
    /// Senior audit daemon
    pub audit: AuditConfig,
    /// Infrastructure diagnostics
    pub diagnostics: DiagnosticsConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Co-located processes supervised in `processes` liveness mode
    pub processes: Vec<ProcessConfig>,
}

/// Message bus connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// `nats://` or `tls://` for a JetStream server; `memory://` selects the in-process bus
    pub url: String,
    /// NATS `.creds` file used when connecting
    pub credentials: Option<PathBuf>,
    /// JetStream stream holding durable subjects
    pub stream: String,
    /// Window within which a repeated dedup key is dropped
    pub dedup_window_secs: u64,
    /// Messages retained for history queries
    pub max_history: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            credentials: None,
            stream: "WARDEN".to_string(),
            dedup_window_secs: 120,
            max_history: 100_000,
        }
    }
}

/// External request store API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the store's HTTP API; in-memory store when absent
    pub base_url: Option<String>,
    /// Bearer token sent with every store call
    pub api_token: Option<String>,
    /// Per-call HTTP timeout
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            request_timeout_secs: 30,
        }
    }
}

/// Audit history database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite path (or `:memory:`)
    pub url: Option<String>,
    /// Connection budget reported in database health
    pub max_connections: u32,
    /// Health-query round trip above which the database is reported slow
    pub slow_query_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            slow_query_secs: 10,
        }
    }
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name as it appears in subjects
    pub name: String,
    /// Worker identity that publishes this stage's completions
    pub worker: String,
    /// Stage timeout; the pipeline default applies when absent
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
}

impl StageConfig {
    fn new(name: &str, worker: &str, timeout_minutes: u64) -> Self {
        Self {
            name: name.to_string(),
            worker: worker.to_string(),
            timeout_minutes: Some(timeout_minutes),
        }
    }
}

/// Fixed stage order and per-stage timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stages in execution order
    pub stages: Vec<StageConfig>,
    /// Timeout for stages without their own
    pub default_stage_timeout_minutes: u64,
    /// Completed entries kept for duration statistics
    pub history_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                StageConfig::new("research", "researcher", 30),
                StageConfig::new("critique", "critic", 20),
                StageConfig::new("backend", "backend-developer", 60),
                StageConfig::new("frontend", "frontend-developer", 60),
                StageConfig::new("qa", "qa-engineer", 45),
                StageConfig::new("statistics", "statistician", 15),
            ],
            default_stage_timeout_minutes: 60,
            history_capacity: 1_000,
        }
    }
}

/// Orphan detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// Inactivity after which in-progress work is orphaned
    pub threshold_minutes: u64,
    /// Time between periodic sweeps
    pub sweep_interval_minutes: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 60,
            sweep_interval_minutes: 15,
        }
    }
}

impl OrphanConfig {
    /// Orphan threshold
    #[must_use]
    pub fn threshold(&self) -> chrono::Duration {
        minutes(self.threshold_minutes)
    }

    /// Sweep interval
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes * 60)
    }
}

/// How the recovery daemon decides co-located processes are alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// Pid files of co-located processes, restarted when dead
    #[default]
    Processes,
    /// All daemons share one process; a bus round-trip is the signal
    BusRoundTrip,
}

/// Recovery health-check daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Time between periodic health checks
    pub interval_minutes: u64,
    /// Inactivity after which a request is recovered
    pub stuck_threshold_minutes: u64,
    /// Phase a stuck request is reset to so the pipeline picks it up again
    pub reschedule_phase: Phase,
    /// More blocked requests than this is critical
    pub blocked_critical_threshold: usize,
    /// More orphaned deliverables than this is degraded
    pub orphaned_deliverables_threshold: usize,
    /// How co-located processes are checked
    pub liveness: LivenessMode,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 300,
            stuck_threshold_minutes: 60,
            reschedule_phase: Phase::Backlog,
            blocked_critical_threshold: 3,
            orphaned_deliverables_threshold: 10,
            liveness: LivenessMode::Processes,
        }
    }
}

impl RecoveryConfig {
    /// Sweep interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    /// Stuck threshold
    #[must_use]
    pub fn stuck_threshold(&self) -> chrono::Duration {
        minutes(self.stuck_threshold_minutes)
    }
}

/// External command that answers audit requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommandConfig {
    /// Executable receiving each audit request as JSON on stdin
    pub program: String,
    /// Arguments passed to `program`
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the command after this long
    #[serde(default = "default_worker_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_worker_timeout_minutes() -> u64 {
    120
}

/// Senior audit daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Run the periodic audit loop
    pub enabled: bool,
    /// Persist audit results for adaptive timeouts (requires `database.url`)
    pub persist_results: bool,
    /// Audit type requested by the daily schedule
    pub audit_type: AuditType,
    /// Timeout used without enough history
    pub default_timeout_minutes: u64,
    /// Lower bound of the adaptive timeout
    pub min_timeout_minutes: u64,
    /// Upper bound of the adaptive timeout
    pub max_timeout_minutes: u64,
    /// Multiplier on the historical average duration
    pub buffer_factor: f64,
    /// Age of results used for the average, and of the pruning cutoff
    pub history_window_days: i64,
    /// Log a warning when no response arrived after this long
    pub early_warning_minutes: u64,
    /// Retries after the first attempt before escalating
    pub max_retries: u32,
    /// Backoff before the first retry; doubles each retry
    pub retry_base_delay_secs: u64,
    /// Hour of day (UTC) of the daily audit
    pub daily_hour: u32,
    /// Owner of escalation tickets
    pub operations_owner: String,
    /// Worker requested for CRITICAL recommendations
    pub remediation_worker: String,
    /// Command answering audits in-process; external consumers otherwise
    pub worker_command: Option<WorkerCommandConfig>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_results: true,
            audit_type: AuditType::full_system(),
            default_timeout_minutes: 30,
            min_timeout_minutes: 10,
            max_timeout_minutes: 90,
            buffer_factor: 1.5,
            history_window_days: 30,
            early_warning_minutes: 5,
            max_retries: 3,
            retry_base_delay_secs: 30,
            daily_hour: 2,
            operations_owner: "devops-engineer".to_string(),
            remediation_worker: "remediation-engineer".to_string(),
            worker_command: None,
        }
    }
}

impl AuditConfig {
    /// Static fallback timeout
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_minutes * 60)
    }

    /// Lower clamp of the adaptive timeout
    #[must_use]
    pub fn min_timeout(&self) -> Duration {
        Duration::from_secs(self.min_timeout_minutes * 60)
    }

    /// Upper clamp of the adaptive timeout
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_minutes * 60)
    }

    /// Delay before the early warning
    #[must_use]
    pub fn early_warning(&self) -> Duration {
        Duration::from_secs(self.early_warning_minutes * 60)
    }

    /// Base delay of the exponential backoff
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }
}

/// Diagnostics service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Time budget of each probe
    pub probe_timeout_secs: u64,
    /// Bus streams whose backlog and consumers are inspected
    pub streams: Vec<String>,
    /// Age of spawn records counted in spawn health
    pub spawn_window_minutes: i64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            streams: vec![
                crate::bus::subjects::AUDIT_REQUEST.to_string(),
                crate::bus::subjects::AUDIT_RESPONSE.to_string(),
                crate::bus::subjects::SPAWN_REQUEST.to_string(),
            ],
            spawn_window_minutes: 60,
        }
    }
}

impl DiagnosticsConfig {
    /// Per-probe time budget
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// A co-located long-running process watched by the recovery daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Name used in logs and liveness reports
    pub name: String,
    /// Executable started when the process is found dead
    pub program: String,
    /// Arguments passed to `program`
    #[serde(default)]
    pub args: Vec<String>,
    /// Written with the pid of each started process
    pub pid_file: PathBuf,
    /// Receives stdout and stderr, appended
    pub log_file: PathBuf,
}

fn minutes(value: u64) -> chrono::Duration {
    chrono::Duration::minutes(i64::try_from(value).unwrap_or(i64::MAX / 60_000))
}

impl WardenConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With database URL
    #[inline]
    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.url = Some(url.into());
        self
    }

    /// With orphan threshold
    #[inline]
    #[must_use]
    pub fn with_orphan_threshold_minutes(mut self, minutes: u64) -> Self {
        self.orphan.threshold_minutes = minutes;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, base_delay_secs: u64) -> Self {
        self.audit.max_retries = max_retries;
        self.audit.retry_base_delay_secs = base_delay_secs;
        self
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed TOML
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from an optional file, apply environment overrides, and validate
    ///
    /// # Errors
    /// Any read, parse, or validation failure
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WARDEN_*` overrides using the given lookup
    ///
    /// # Errors
    /// - `ConfigError::Invalid` when an override does not parse
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WARDEN_BUS_URL") {
            self.bus.url = v;
        }
        if let Some(v) = lookup("WARDEN_BUS_CREDENTIALS") {
            self.bus.credentials = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("WARDEN_BUS_STREAM") {
            self.bus.stream = v;
        }
        if let Some(v) = lookup("WARDEN_STORE_URL") {
            self.store.base_url = Some(v);
        }
        if let Some(v) = lookup("WARDEN_STORE_TOKEN") {
            self.store.api_token = Some(v);
        }
        if let Some(v) = lookup("WARDEN_DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Some(v) = lookup("WARDEN_ORPHAN_THRESHOLD_MINUTES") {
            self.orphan.threshold_minutes = parse_env("orphan.threshold_minutes", &v)?;
        }
        if let Some(v) = lookup("WARDEN_STUCK_THRESHOLD_MINUTES") {
            self.recovery.stuck_threshold_minutes =
                parse_env("recovery.stuck_threshold_minutes", &v)?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_MIN_TIMEOUT_MINUTES") {
            self.audit.min_timeout_minutes = parse_env("audit.min_timeout_minutes", &v)?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_MAX_TIMEOUT_MINUTES") {
            self.audit.max_timeout_minutes = parse_env("audit.max_timeout_minutes", &v)?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_BUFFER_FACTOR") {
            self.audit.buffer_factor = parse_env("audit.buffer_factor", &v)?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_MAX_RETRIES") {
            self.audit.max_retries = parse_env("audit.max_retries", &v)?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_RETRY_BASE_DELAY_SECS") {
            self.audit.retry_base_delay_secs = parse_env("audit.retry_base_delay_secs", &v)?;
        }
        if let Some(v) = lookup("WARDEN_AUDIT_DAILY_HOUR") {
            self.audit.daily_hour = parse_env("audit.daily_hour", &v)?;
        }
        if let Some(v) = lookup("WARDEN_LOG_JSON") {
            self.logging.json = parse_env("logging.json", &v)?;
        }
        Ok(())
    }

    /// Validate the configuration once at startup
    ///
    /// # Errors
    /// - `ConfigError::Missing` when audit persistence lacks a database
    /// - `ConfigError::Invalid` on out-of-range or inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.url.trim().is_empty() {
            return Err(ConfigError::Missing("bus.url"));
        }
        if self.bus.stream.is_empty() || self.bus.stream.contains(['.', '*', '>', ' ']) {
            return Err(ConfigError::invalid(
                "bus.stream",
                format!("invalid stream name '{}'", self.bus.stream),
            ));
        }
        if self.pipeline.stages.is_empty() {
            return Err(ConfigError::invalid("pipeline.stages", "at least one stage is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for stage in &self.pipeline.stages {
            if stage.name.is_empty() || stage.name.contains('.') {
                return Err(ConfigError::invalid(
                    "pipeline.stages",
                    format!("invalid stage name '{}'", stage.name),
                ));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::invalid(
                    "pipeline.stages",
                    format!("duplicate stage '{}'", stage.name),
                ));
            }
            if stage.timeout_minutes == Some(0) {
                return Err(ConfigError::invalid(
                    "pipeline.stages",
                    format!("stage '{}' has a zero timeout", stage.name),
                ));
            }
        }
        if self.pipeline.default_stage_timeout_minutes == 0 {
            return Err(ConfigError::invalid("pipeline.default_stage_timeout_minutes", "must be positive"));
        }
        if self.orphan.threshold_minutes == 0 {
            return Err(ConfigError::invalid("orphan.threshold_minutes", "must be positive"));
        }
        if self.orphan.sweep_interval_minutes == 0 {
            return Err(ConfigError::invalid("orphan.sweep_interval_minutes", "must be positive"));
        }
        if self.recovery.interval_minutes == 0 {
            return Err(ConfigError::invalid("recovery.interval_minutes", "must be positive"));
        }
        if self.recovery.reschedule_phase.is_terminal()
            || self.recovery.reschedule_phase == Phase::InProgress
        {
            return Err(ConfigError::invalid(
                "recovery.reschedule_phase",
                format!("'{}' is not re-schedulable", self.recovery.reschedule_phase),
            ));
        }
        let audit = &self.audit;
        if audit.min_timeout_minutes == 0 || audit.min_timeout_minutes > audit.max_timeout_minutes {
            return Err(ConfigError::invalid(
                "audit.min_timeout_minutes",
                "must be positive and not exceed audit.max_timeout_minutes",
            ));
        }
        if !(audit.buffer_factor.is_finite() && audit.buffer_factor >= 1.0) {
            return Err(ConfigError::invalid("audit.buffer_factor", "must be at least 1.0"));
        }
        if audit.daily_hour > 23 {
            return Err(ConfigError::invalid("audit.daily_hour", "must be between 0 and 23"));
        }
        if audit.max_retries > 10 {
            return Err(ConfigError::invalid("audit.max_retries", "must be at most 10"));
        }
        if audit.history_window_days <= 0 {
            return Err(ConfigError::invalid("audit.history_window_days", "must be positive"));
        }
        if audit.enabled && audit.persist_results && self.database.url.is_none() {
            return Err(ConfigError::Missing("database.url"));
        }
        if self.diagnostics.probe_timeout_secs == 0 {
            return Err(ConfigError::invalid("diagnostics.probe_timeout_secs", "must be positive"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("cannot parse '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> WardenConfig {
        WardenConfig::new().with_database_url(":memory:")
    }

    #[test]
    fn defaults_validate_with_database() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn persistence_without_database_fails_fast() {
        let err = WardenConfig::new().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("database.url")));

        let mut config = WardenConfig::new();
        config.audit.persist_results = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = WardenConfig::from_toml_str(
            r#"
            [database]
            url = "/var/lib/warden/audit.db"

            [orphan]
            threshold_minutes = 90

            [audit]
            max_retries = 2
            daily_hour = 4

            [[pipeline.stages]]
            name = "research"
            worker = "researcher"

            [[pipeline.stages]]
            name = "build"
            worker = "builder"
            timeout_minutes = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.orphan.threshold_minutes, 90);
        assert_eq!(config.orphan.sweep_interval_minutes, 15);
        assert_eq!(config.audit.max_retries, 2);
        assert_eq!(config.pipeline.stages.len(), 2);
        assert_eq!(config.pipeline.stages[0].timeout_minutes, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("WARDEN_ORPHAN_THRESHOLD_MINUTES", "30"),
            ("WARDEN_AUDIT_MAX_RETRIES", "5"),
            ("WARDEN_DATABASE_URL", "/tmp/a.db"),
        ]
        .into_iter()
        .collect();

        let mut config = WardenConfig::new();
        config
            .apply_env_with(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.orphan.threshold_minutes, 30);
        assert_eq!(config.audit.max_retries, 5);
        assert_eq!(config.database.url.as_deref(), Some("/tmp/a.db"));
    }

    #[test]
    fn env_override_parse_error() {
        let mut config = WardenConfig::new();
        let err = config
            .apply_env_with(|k| (k == "WARDEN_AUDIT_DAILY_HOUR").then(|| "noon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "audit.daily_hour", .. }));
    }

    #[test]
    fn rejects_inconsistent_values() {
        let mut config = valid();
        config.audit.min_timeout_minutes = 120;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.audit.buffer_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.audit.daily_hour = 24;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.recovery.reschedule_phase = Phase::Done;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.pipeline.stages.push(config.pipeline.stages[0].clone());
        assert!(config.validate().is_err());

        let mut config = valid();
        config.bus.stream = "warden.events".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "bus.stream", .. })));
    }

    #[test]
    fn bus_defaults_to_external_server() {
        let config = WardenConfig::new();
        assert_eq!(config.bus.url, "nats://127.0.0.1:4222");
        assert_eq!(config.bus.stream, "WARDEN");

        let config = WardenConfig::from_toml_str(
            r#"
            [bus]
            url = "tls://bus.internal:4222"
            credentials = "/etc/warden/warden.creds"
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.credentials.as_deref(), Some(Path::new("/etc/warden/warden.creds")));
        assert_eq!(config.bus.dedup_window_secs, 120);
    }
}
