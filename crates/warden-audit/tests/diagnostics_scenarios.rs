use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use warden_audit::report::render_markdown;
use warden_audit::{
    AuditDiagnostics, DatabaseHealth, DatabaseProbe, HostHealth, HostProbe, SpawnRecord, SqliteAuditStore,
};
use warden_core::bus::subjects;
use warden_core::{publish_json, InMemoryBus, Severity};
use warden_test_utils::FakeHostProbe;

#[tokio::test]
async fn idle_audit_stream_is_the_probable_cause() {
    let bus = Arc::new(InMemoryBus::new());
    bus.declare_work_queue(subjects::AUDIT_REQUEST);
    for i in 0..50 {
        let id = format!("audit-{i}");
        publish_json(bus.as_ref(), subjects::AUDIT_REQUEST, &serde_json::json!({ "auditRequestId": id }), Some(&id))
            .await
            .unwrap();
    }
    let diagnostics = AuditDiagnostics::new(bus, Arc::new(FakeHostProbe::idle()));

    let report = diagnostics.diagnose(Some("audit-x")).await;

    assert_eq!(report.probable_cause, "no consumers for audit stream");
    assert!(report.severity >= Severity::High);
    let stream = report
        .bus
        .streams
        .iter()
        .find(|s| s.subject == subjects::AUDIT_REQUEST)
        .unwrap();
    assert_eq!((stream.pending, stream.consumers), (50, 0));
    assert!(render_markdown(&report).contains("| audit.request | 50 | 0 |"));
}

#[tokio::test]
async fn spawn_failures_from_sqlite_history() {
    let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
    store.enable_spawn_history().await.unwrap();
    for success in [true, false, false, false] {
        store
            .record_spawn(&SpawnRecord {
                worker: "backend-developer".into(),
                started_at: Utc::now(),
                success,
                spawn_ms: Some(2_000),
            })
            .await
            .unwrap();
    }
    let diagnostics = AuditDiagnostics::new(Arc::new(InMemoryBus::new()), Arc::new(FakeHostProbe::idle()))
        .with_database(store.clone())
        .with_spawn_history(store);

    let report = diagnostics.diagnose(None).await;

    assert_eq!(report.severity, Severity::Critical);
    assert_eq!(report.probable_cause, "worker spawn failures");
    assert_eq!(report.spawn.attempts, 4);
    assert_eq!(report.spawn.success_rate, Some(0.25));
    assert!(report.database.as_ref().is_some_and(|db| db.connected));
}

#[tokio::test]
async fn disconnected_bus_degrades_to_partial_report() {
    let bus = Arc::new(InMemoryBus::new());
    bus.set_connected(false);
    let diagnostics = AuditDiagnostics::new(bus, Arc::new(FakeHostProbe::idle()));

    let report = diagnostics.diagnose(None).await;

    assert!(!report.bus.connected);
    assert!(report.bus.error.is_some());
    assert_eq!(report.host.cpu_cores, 4);
    assert_eq!(report.probable_cause, "message bus disconnected");
    assert_eq!(report.severity, Severity::Critical);
}

struct HangingHost;

#[async_trait::async_trait]
impl HostProbe for HangingHost {
    async fn probe(&self) -> HostHealth {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        HostHealth::default()
    }
}

struct DownDatabase;

#[async_trait::async_trait]
impl DatabaseProbe for DownDatabase {
    async fn probe(&self) -> DatabaseHealth {
        DatabaseHealth::disconnected("connection refused")
    }
}

#[tokio::test(start_paused = true)]
async fn slow_probe_is_cut_off_and_others_still_report() {
    let diagnostics = AuditDiagnostics::new(Arc::new(InMemoryBus::new()), Arc::new(HangingHost))
        .with_database(Arc::new(DownDatabase))
        .with_probe_timeout(Duration::from_secs(10));

    let report = diagnostics.diagnose(None).await;

    assert!(report.host.error.as_deref().is_some_and(|e| e.contains("timed out")));
    assert!(report.bus.connected);
    assert_eq!(report.probable_cause, "database disconnected");
    assert!(report.recommendations[0].starts_with("CRITICAL: Restore database connectivity"));
}
