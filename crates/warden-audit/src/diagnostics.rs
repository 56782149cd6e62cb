//! Audit diagnostics
//!
//! Provides:
//! - Component health snapshots (bus, database, spawn history, host)
//! - [`AuditDiagnostics`]: runs the probes in parallel, each under a time budget
//! - [`analyze`]: ordered root-cause rules producing a [`DiagnosticReport`]
//!
//! A failed probe contributes a partial snapshot carrying its error; the
//! remaining probes are unaffected.

use crate::history::{DatabaseHealth, DatabaseProbe, SpawnHistory, SpawnRecord};
use crate::host::{HostHealth, HostProbe};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use warden_core::bus::subjects;
use warden_core::config::DiagnosticsConfig;
use warden_core::{MessageBus, Severity};

/// Cause reported when no rule fires
pub const UNKNOWN_CAUSE: &str = "unknown/transient";

/// Backlog and consumers of one bus stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHealth {
    /// Inspected subject
    pub subject: String,
    /// Messages not yet delivered to a consumer
    pub pending: u64,
    /// Consumers attached to the subject
    pub consumers: usize,
}

/// Message bus snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusHealth {
    /// The bus answered a ping
    pub connected: bool,
    /// Ping round trip
    pub latency_ms: Option<f64>,
    /// One entry per configured stream
    pub streams: Vec<StreamHealth>,
    /// Set when the bus could not be inspected
    pub error: Option<String>,
}

/// Worker spawn snapshot over the configured window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpawnHealth {
    /// Spawn attempts inside the window
    pub attempts: usize,
    /// Attempts that produced a running worker
    pub successes: usize,
    /// `successes / attempts` in `[0, 1]`; `None` without attempts
    pub success_rate: Option<f64>,
    /// Mean over timed attempts only
    pub avg_spawn_ms: Option<f64>,
    /// Set when spawn history is unavailable
    pub error: Option<String>,
}

impl SpawnHealth {
    /// Summarize spawn records
    #[must_use]
    pub fn from_records(records: &[SpawnRecord]) -> Self {
        let attempts = records.len();
        let successes = records.iter().filter(|r| r.success).count();
        let timed: Vec<u64> = records.iter().filter_map(|r| r.spawn_ms).collect();
        Self {
            attempts,
            successes,
            success_rate: (attempts > 0).then(|| successes as f64 / attempts as f64),
            avg_spawn_ms: (!timed.is_empty()).then(|| timed.iter().sum::<u64>() as f64 / timed.len() as f64),
            error: None,
        }
    }

    fn unavailable(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One fired rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Severity of the fired rule
    pub severity: Severity,
    /// Short probable cause, e.g. `database disconnected`
    pub cause: String,
    /// Action for an operator, without the priority label
    pub recommendation: String,
}

impl Finding {
    fn new(severity: Severity, cause: impl Into<String>, recommendation: impl Into<String>) -> Self {
        Self {
            severity,
            cause: cause.into(),
            recommendation: recommendation.into(),
        }
    }
}

/// Outcome of a diagnostic run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    /// When the snapshots were taken
    pub timestamp: DateTime<Utc>,
    /// Audit that triggered the run, if any
    pub audit_request_id: Option<String>,
    /// Bus snapshot
    pub bus: BusHealth,
    /// `None` when no database is configured
    pub database: Option<DatabaseHealth>,
    /// Spawn history snapshot
    pub spawn: SpawnHealth,
    /// Host resource snapshot
    pub host: HostHealth,
    /// Fired rules in rule order
    pub findings: Vec<Finding>,
    /// Highest severity first, each prefixed with its priority label
    pub recommendations: Vec<String>,
    /// Cause of the first highest-severity finding, or [`UNKNOWN_CAUSE`]
    pub probable_cause: String,
    /// Highest finding severity; medium when nothing fired
    pub severity: Severity,
}

/// Apply the ordered rules to a set of snapshots
///
/// Rules, in order:
/// 1. bus disconnected: critical
/// 2. stream with backlog and zero consumers: high
/// 3. database disconnected: critical
/// 4. health query slower than the database's threshold: high
/// 5. spawn success rate below 50%: critical
/// 6. CPU or memory above 90%: critical
/// 7. load above twice the core count: high
#[must_use]
pub fn analyze(
    bus: &BusHealth,
    database: Option<&DatabaseHealth>,
    spawn: &SpawnHealth,
    host: &HostHealth,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    if !bus.connected {
        findings.push(Finding::new(
            Severity::Critical,
            "message bus disconnected",
            format!(
                "Restore message bus connectivity ({})",
                bus.error.as_deref().unwrap_or("no response")
            ),
        ));
    }

    for stream in bus.streams.iter().filter(|s| s.consumers == 0 && s.pending > 0) {
        let cause = if stream.subject == subjects::AUDIT_REQUEST {
            "no consumers for audit stream".to_string()
        } else {
            format!("no consumers for stream {}", stream.subject)
        };
        findings.push(Finding::new(
            Severity::High,
            cause,
            format!(
                "Start a consumer for {} ({} messages pending)",
                stream.subject, stream.pending
            ),
        ));
    }

    if let Some(db) = database {
        if !db.connected {
            findings.push(Finding::new(
                Severity::Critical,
                "database disconnected",
                format!(
                    "Restore database connectivity ({})",
                    db.error.as_deref().unwrap_or("no response")
                ),
            ));
        } else if db.slow_round_trip {
            findings.push(Finding::new(
                Severity::High,
                "slow database round trip",
                format!(
                    "Investigate database latency: the health query took {}",
                    db.latency_ms.map_or_else(|| "too long".to_string(), |ms| format!("{ms} ms"))
                ),
            ));
        }
    }

    if let Some(rate) = spawn.success_rate.filter(|r| *r < 0.5) {
        findings.push(Finding::new(
            Severity::Critical,
            "worker spawn failures",
            format!(
                "Fix worker spawning: {}/{} attempts succeeded ({:.0}%)",
                spawn.successes,
                spawn.attempts,
                rate * 100.0
            ),
        ));
    }

    if let Some(cpu) = host.cpu_percent.filter(|c| *c > 90.0) {
        findings.push(Finding::new(
            Severity::Critical,
            "CPU exhaustion",
            format!("Reduce CPU pressure on the host ({cpu:.1}% used)"),
        ));
    }
    if let Some(memory) = host.memory_percent.filter(|m| *m > 90.0) {
        findings.push(Finding::new(
            Severity::Critical,
            "memory exhaustion",
            format!("Free memory on the host ({memory:.1}% used)"),
        ));
    }

    let cores = host.cpu_cores.max(1);
    if let Some(load) = host.load_average.filter(|l| *l > 2.0 * cores as f64) {
        findings.push(Finding::new(
            Severity::High,
            "host overloaded",
            format!("Shed load: load average {load:.2} on {cores} cores"),
        ));
    }

    findings
}

/// Turn findings into the summary fields of a report
///
/// Returns `(probable_cause, severity, recommendations)`.
#[must_use]
pub fn summarize(findings: &[Finding]) -> (String, Severity, Vec<String>) {
    let Some(severity) = findings.iter().map(|f| f.severity).max() else {
        return (
            UNKNOWN_CAUSE.to_string(),
            Severity::Medium,
            vec![format!(
                "{}: No infrastructure fault detected; re-run the audit and inspect the audit worker logs",
                Severity::Medium.priority().label()
            )],
        );
    };

    let cause = findings
        .iter()
        .find(|f| f.severity == severity)
        .map(|f| f.cause.clone())
        .unwrap_or_else(|| UNKNOWN_CAUSE.to_string());

    let mut ranked: Vec<&Finding> = findings.iter().collect();
    ranked.sort_by(|a, b| b.severity.cmp(&a.severity));
    let recommendations = ranked
        .into_iter()
        .map(|f| format!("{}: {}", f.severity.priority().label(), f.recommendation))
        .collect();

    (cause, severity, recommendations)
}

/// Parallel component probes
pub struct AuditDiagnostics {
    bus: Arc<dyn MessageBus>,
    database: Option<Arc<dyn DatabaseProbe>>,
    spawns: Option<Arc<dyn SpawnHistory>>,
    host: Arc<dyn HostProbe>,
    streams: Vec<String>,
    probe_timeout: Duration,
    spawn_window: chrono::Duration,
}

impl AuditDiagnostics {
    /// Create diagnostics over the bus and a host probe
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, host: Arc<dyn HostProbe>) -> Self {
        Self::from_config(bus, host, &DiagnosticsConfig::default())
    }

    /// Create diagnostics with configured streams and budgets
    #[must_use]
    pub fn from_config(bus: Arc<dyn MessageBus>, host: Arc<dyn HostProbe>, config: &DiagnosticsConfig) -> Self {
        Self {
            bus,
            database: None,
            spawns: None,
            host,
            streams: config.streams.clone(),
            probe_timeout: config.probe_timeout(),
            spawn_window: chrono::Duration::minutes(config.spawn_window_minutes),
        }
    }

    /// With database probe
    #[inline]
    #[must_use]
    pub fn with_database(mut self, database: Arc<dyn DatabaseProbe>) -> Self {
        self.database = Some(database);
        self
    }

    /// With spawn history
    #[inline]
    #[must_use]
    pub fn with_spawn_history(mut self, spawns: Arc<dyn SpawnHistory>) -> Self {
        self.spawns = Some(spawns);
        self
    }

    /// With per-probe time budget
    #[inline]
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Run all probes and analyze
    pub async fn diagnose(&self, audit_request_id: Option<&str>) -> DiagnosticReport {
        let (bus, database, spawn, host) = tokio::join!(
            self.probe_bus(),
            self.probe_database(),
            self.probe_spawns(),
            self.probe_host(),
        );

        let findings = analyze(&bus, database.as_ref(), &spawn, &host);
        let (probable_cause, severity, recommendations) = summarize(&findings);
        tracing::info!(
            %severity,
            cause = %probable_cause,
            findings = findings.len(),
            "Diagnostics complete"
        );

        DiagnosticReport {
            timestamp: Utc::now(),
            audit_request_id: audit_request_id.map(str::to_string),
            bus,
            database,
            spawn,
            host,
            findings,
            recommendations,
            probable_cause,
            severity,
        }
    }

    async fn probe_bus(&self) -> BusHealth {
        let probe = async {
            let latency = match self.bus.ping().await {
                Ok(latency) => latency,
                Err(e) => {
                    return BusHealth {
                        connected: false,
                        error: Some(e.to_string()),
                        ..BusHealth::default()
                    }
                }
            };
            let mut health = BusHealth {
                connected: true,
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                ..BusHealth::default()
            };
            for subject in &self.streams {
                match self.bus.stream_info(subject).await {
                    Ok(info) => health.streams.push(StreamHealth {
                        subject: info.subject,
                        pending: info.pending,
                        consumers: info.consumers,
                    }),
                    Err(e) => {
                        tracing::warn!(subject = %subject, error = %e, "Stream info unavailable");
                        health.error.get_or_insert_with(|| e.to_string());
                    }
                }
            }
            health
        };

        tokio::time::timeout(self.probe_timeout, probe)
            .await
            .unwrap_or_else(|_| BusHealth {
                connected: false,
                error: Some(format!("bus probe timed out after {:?}", self.probe_timeout)),
                ..BusHealth::default()
            })
    }

    async fn probe_database(&self) -> Option<DatabaseHealth> {
        let database = self.database.as_ref()?;
        let health = tokio::time::timeout(self.probe_timeout, database.probe())
            .await
            .unwrap_or_else(|_| {
                DatabaseHealth::disconnected(format!("database probe timed out after {:?}", self.probe_timeout))
            });
        Some(health)
    }

    async fn probe_spawns(&self) -> SpawnHealth {
        let Some(spawns) = &self.spawns else {
            return SpawnHealth::unavailable("spawn history not configured");
        };
        let since = Utc::now() - self.spawn_window;
        match tokio::time::timeout(self.probe_timeout, spawns.spawns_since(since)).await {
            Ok(Ok(Some(records))) => SpawnHealth::from_records(&records),
            Ok(Ok(None)) => SpawnHealth::unavailable("spawn history not recorded"),
            Ok(Err(e)) => SpawnHealth::unavailable(e.to_string()),
            Err(_) => SpawnHealth::unavailable(format!("spawn probe timed out after {:?}", self.probe_timeout)),
        }
    }

    async fn probe_host(&self) -> HostHealth {
        tokio::time::timeout(self.probe_timeout, self.host.probe())
            .await
            .unwrap_or_else(|_| HostHealth {
                error: Some(format!("host probe timed out after {:?}", self.probe_timeout)),
                ..HostHealth::default()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_bus() -> BusHealth {
        BusHealth {
            connected: true,
            latency_ms: Some(1.0),
            streams: vec![StreamHealth {
                subject: subjects::AUDIT_REQUEST.into(),
                pending: 0,
                consumers: 1,
            }],
            error: None,
        }
    }

    fn healthy_host() -> HostHealth {
        HostHealth {
            cpu_percent: Some(20.0),
            memory_percent: Some(40.0),
            load_average: Some(1.0),
            cpu_cores: 4,
            ..HostHealth::default()
        }
    }

    #[test]
    fn nothing_fired_is_unknown_at_medium() {
        let findings = analyze(&healthy_bus(), None, &SpawnHealth::default(), &healthy_host());
        assert!(findings.is_empty());
        let (cause, severity, recs) = summarize(&findings);
        assert_eq!(cause, UNKNOWN_CAUSE);
        assert_eq!(severity, Severity::Medium);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].starts_with("MEDIUM:"));
    }

    #[test]
    fn idle_audit_stream_is_named() {
        let mut bus = healthy_bus();
        bus.streams[0] = StreamHealth {
            subject: subjects::AUDIT_REQUEST.into(),
            pending: 50,
            consumers: 0,
        };
        let findings = analyze(&bus, None, &SpawnHealth::default(), &healthy_host());
        let (cause, severity, recs) = summarize(&findings);
        assert_eq!(cause, "no consumers for audit stream");
        assert_eq!(severity, Severity::High);
        assert!(recs[0].starts_with("HIGH: Start a consumer for audit.request"));
    }

    #[test]
    fn highest_severity_wins_in_rule_order() {
        let mut bus = healthy_bus();
        bus.streams[0].pending = 5;
        bus.streams[0].consumers = 0;
        let db = DatabaseHealth::disconnected("connection refused");
        let host = HostHealth {
            memory_percent: Some(95.0),
            ..healthy_host()
        };
        let findings = analyze(&bus, Some(&db), &SpawnHealth::default(), &host);
        let (cause, severity, recs) = summarize(&findings);
        assert_eq!(severity, Severity::Critical);
        assert_eq!(cause, "database disconnected");
        assert!(recs[0].starts_with("CRITICAL:"));
        assert!(recs[1].starts_with("CRITICAL:"));
        assert!(recs[2].starts_with("HIGH:"));
    }

    #[test]
    fn spawn_and_load_rules() {
        let records: Vec<SpawnRecord> = (0..4)
            .map(|i| SpawnRecord {
                worker: "qa-engineer".into(),
                started_at: Utc::now(),
                success: i == 0,
                spawn_ms: Some(1000),
            })
            .collect();
        let spawn = SpawnHealth::from_records(&records);
        assert_eq!(spawn.success_rate, Some(0.25));
        assert_eq!(spawn.avg_spawn_ms, Some(1000.0));

        let host = HostHealth {
            load_average: Some(9.0),
            ..healthy_host()
        };
        let findings = analyze(&healthy_bus(), None, &spawn, &host);
        let causes: Vec<_> = findings.iter().map(|f| f.cause.as_str()).collect();
        assert_eq!(causes, vec!["worker spawn failures", "host overloaded"]);
    }

    #[test]
    fn slow_database_round_trip_is_high() {
        let db = DatabaseHealth {
            connected: true,
            latency_ms: Some(12_000),
            slow_round_trip: true,
            ..DatabaseHealth::default()
        };
        let findings = analyze(&healthy_bus(), Some(&db), &SpawnHealth::default(), &healthy_host());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].cause, "slow database round trip");
        assert!(findings[0].recommendation.ends_with("took 12000 ms"));
    }

    #[test]
    fn disconnected_bus_is_critical() {
        let bus = BusHealth {
            connected: false,
            error: Some("bus disconnected".into()),
            ..BusHealth::default()
        };
        let (cause, severity, _) = summarize(&analyze(&bus, None, &SpawnHealth::default(), &HostHealth::default()));
        assert_eq!(cause, "message bus disconnected");
        assert_eq!(severity, Severity::Critical);
    }
}
