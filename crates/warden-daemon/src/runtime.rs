//! Runtime wiring
//!
//! Builds every collaborator from a validated [`WardenConfig`] and runs the
//! daemons side by side until shutdown or a fatal audit escalation.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use warden_audit::{AuditDiagnostics, AuditError, AuditHistory, ProcHostProbe, SeniorAuditDaemon, SqliteAuditStore};
use warden_core::bus::subjects;
use warden_core::config::{BusConfig, LivenessMode};
use warden_core::worker::AUDIT_WORKER_GROUP;
use warden_core::{
    CommandWorker, HttpRequestStore, InMemoryBus, InMemoryRequestStore, MessageBus, NatsBus, Pipeline, RequestStore,
    WardenConfig, WorkerBridge,
};
use warden_recovery::{
    BusRoundTripProbe, LivenessProbe, OrphanDetector, PidFileSupervisor, RecoveryDaemon, SharedStageTracker,
    StageEventListener, StageTracker,
};

/// Scheme of the in-process bus
pub const MEMORY_BUS_SCHEME: &str = "memory://";

/// Schemes served by the JetStream client
pub const NATS_BUS_SCHEMES: &[&str] = &["nats://", "tls://"];

/// Time in-flight sweeps get to finish after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Connect the bus named by `config.url` and declare the audit work queue
///
/// # Errors
/// - Unsupported URL scheme
/// - The external bus cannot be reached or set up
pub async fn connect_bus(config: &BusConfig) -> anyhow::Result<Arc<dyn MessageBus>> {
    if config.url.starts_with(MEMORY_BUS_SCHEME) {
        tracing::warn!("Using the in-process bus; history is lost on restart and only in-process workers can answer audits");
        let bus = InMemoryBus::with_limits(Duration::from_secs(config.dedup_window_secs), config.max_history);
        bus.declare_work_queue(subjects::AUDIT_REQUEST);
        return Ok(Arc::new(bus));
    }
    if NATS_BUS_SCHEMES.iter().any(|scheme| config.url.starts_with(scheme)) {
        let bus = NatsBus::connect(config)
            .await
            .context("failed to connect to the message bus")?;
        bus.declare_work_queue(subjects::AUDIT_REQUEST, AUDIT_WORKER_GROUP)
            .await
            .context("failed to declare the audit work queue")?;
        return Ok(Arc::new(bus));
    }
    anyhow::bail!(
        "unsupported bus url '{}': expected nats://, tls:// or {MEMORY_BUS_SCHEME}",
        config.url
    )
}

/// Every collaborator, built once
pub struct Runtime {
    config: WardenConfig,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn RequestStore>,
    pipeline: Pipeline,
    tracker: SharedStageTracker,
    history: Option<Arc<SqliteAuditStore>>,
}

impl Runtime {
    /// Build collaborators from configuration
    ///
    /// # Errors
    /// - Unsupported or unreachable bus
    /// - Store client or audit history cannot be created
    pub async fn build(config: WardenConfig) -> anyhow::Result<Self> {
        let bus = connect_bus(&config.bus).await?;

        let store: Arc<dyn RequestStore> = match HttpRequestStore::from_config(&config.store)
            .context("failed to create request store client")?
        {
            Some(http) => Arc::new(http),
            None => {
                tracing::warn!("No store.base_url configured, requests are kept in memory");
                Arc::new(InMemoryRequestStore::new())
            }
        };

        let history = match config.database.url.as_deref() {
            Some(url) => {
                let store = if url == ":memory:" {
                    SqliteAuditStore::in_memory()
                } else {
                    SqliteAuditStore::open(url)
                }
                .with_context(|| format!("failed to open audit history at {url}"))?
                .with_max_connections(config.database.max_connections)
                .with_slow_round_trip(Duration::from_secs(config.database.slow_query_secs));

                let cutoff = chrono::Utc::now() - chrono::Duration::days(config.audit.history_window_days);
                if let Err(e) = store.prune(cutoff).await {
                    tracing::warn!(error = %e, "Failed to prune audit history");
                }
                Some(Arc::new(store))
            }
            None => None,
        };

        let pipeline = Pipeline::from_config(&config.pipeline);
        let tracker = StageTracker::new(pipeline.clone(), config.pipeline.history_capacity).shared();

        Ok(Self {
            config,
            bus,
            store,
            pipeline,
            tracker,
            history,
        })
    }

    /// Replace the request store, e.g. with an embedding application's own
    #[inline]
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = store;
        self
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// The shared bus
    #[must_use]
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    /// The request store
    #[must_use]
    pub fn store(&self) -> Arc<dyn RequestStore> {
        self.store.clone()
    }

    /// Orphan detector
    #[must_use]
    pub fn orphan_detector(&self) -> Arc<OrphanDetector> {
        Arc::new(
            OrphanDetector::from_config(self.store(), &self.config.orphan).with_tracker(self.tracker.clone()),
        )
    }

    fn liveness(&self) -> Option<Arc<dyn LivenessProbe>> {
        match self.config.recovery.liveness {
            LivenessMode::Processes if self.config.processes.is_empty() => None,
            LivenessMode::Processes => Some(Arc::new(PidFileSupervisor::new(self.config.processes.clone()))),
            LivenessMode::BusRoundTrip => Some(Arc::new(BusRoundTripProbe::new(
                self.bus(),
                self.config.diagnostics.probe_timeout(),
            ))),
        }
    }

    /// Recovery health-check daemon
    #[must_use]
    pub fn recovery_daemon(&self) -> Arc<RecoveryDaemon> {
        let mut daemon = RecoveryDaemon::new(
            self.store(),
            self.bus(),
            self.pipeline.clone(),
            self.config.recovery.clone(),
        )
        .with_tracker(self.tracker.clone());
        if let Some(probe) = self.liveness() {
            daemon = daemon.with_liveness(probe);
        }
        Arc::new(daemon)
    }

    /// Audit diagnostics over every configured probe
    #[must_use]
    pub fn diagnostics(&self) -> AuditDiagnostics {
        let mut diagnostics =
            AuditDiagnostics::from_config(self.bus(), Arc::new(ProcHostProbe::default()), &self.config.diagnostics);
        if let Some(history) = &self.history {
            diagnostics = diagnostics
                .with_database(history.clone())
                .with_spawn_history(history.clone());
        }
        diagnostics
    }

    /// Senior audit daemon
    #[must_use]
    pub fn audit_daemon(&self) -> Arc<SeniorAuditDaemon> {
        let mut daemon = SeniorAuditDaemon::new(
            self.bus(),
            self.store(),
            Arc::new(self.diagnostics()),
            self.config.audit.clone(),
        );
        if self.config.audit.persist_results {
            if let Some(history) = &self.history {
                let history: Arc<dyn AuditHistory> = history.clone();
                daemon = daemon.with_history(history);
            }
        }
        Arc::new(daemon)
    }

    /// Attach the configured audit worker command to the work queue
    #[must_use]
    pub fn spawn_audit_worker(&self, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let Some(command) = &self.config.audit.worker_command else {
            tracing::warn!("No audit.worker_command configured, audits will only be answered by external consumers");
            return None;
        };
        let worker = Arc::new(CommandWorker::from_config(command));
        Some(WorkerBridge::spawn(self.bus(), worker, cancel))
    }

    /// Run every daemon until cancelled
    ///
    /// # Errors
    /// Returns the audit escalation that stopped the process.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let orphans = self.orphan_detector();
        let mut tasks = JoinSet::new();

        let listener = StageEventListener::new()
            .with_tracker(self.tracker.clone())
            .with_orphan_detector(orphans.clone());
        let (bus, token) = (self.bus(), cancel.clone());
        tasks.spawn(async move {
            if let Err(e) = listener.run(bus, token).await {
                tracing::error!(error = %e, "Stage event listener failed");
            }
        });
        tasks.spawn(orphans.run(Some(self.bus()), cancel.clone()));
        tasks.spawn(self.recovery_daemon().run(cancel.clone()));
        if let Some(worker) = self.spawn_audit_worker(cancel.clone()) {
            tasks.spawn(async move {
                let _ = worker.await;
            });
        }

        let outcome = if self.config.audit.enabled {
            let audit = self.audit_daemon().run(cancel.clone()).await;
            if audit.is_err() {
                cancel.cancel();
            }
            audit
        } else {
            cancel.cancelled().await;
            Ok(())
        };

        tracing::info!("Waiting for in-flight work to finish");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Daemon task panicked");
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Shutdown grace elapsed, aborting tasks");
            tasks.abort_all();
        }

        outcome.map_err(anyhow::Error::from)
    }
}

/// Process exit code for a run outcome; escalation is 1
#[must_use]
pub fn exit_code(outcome: &anyhow::Result<()>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(e) if e.downcast_ref::<AuditError>().is_some_and(AuditError::is_fatal) => 1,
        Err(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unknown_bus_schemes() {
        let mut config = WardenConfig::new().with_database_url(":memory:");
        config.bus.url = "amqp://127.0.0.1:5672".into();
        let err = Runtime::build(config).await.err().unwrap();
        assert!(err.to_string().contains("unsupported bus url"));
    }

    #[tokio::test]
    async fn unreachable_nats_server_fails_startup() {
        let mut config = WardenConfig::new().with_database_url(":memory:");
        config.bus.url = "nats://127.0.0.1:1".into();
        let err = Runtime::build(config).await.err().unwrap();
        assert!(format!("{err:#}").contains("cannot connect to message bus"));
    }

    #[test]
    fn escalation_exits_with_one() {
        let escalated: anyhow::Result<()> = Err(AuditError::Escalated {
            audit_id: "audit-1".into(),
            attempts: 4,
            ticket: None,
        }
        .into());
        assert_eq!(exit_code(&escalated), 1);
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(anyhow::anyhow!("bad config"))), 2);
    }
}
