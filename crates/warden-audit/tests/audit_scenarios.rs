use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warden_audit::{
    AuditDiagnostics, AuditError, AuditHistory, InMemoryAuditHistory, SeniorAuditDaemon, SpawnRequest,
};
use warden_core::bus::subjects;
use warden_core::config::AuditConfig;
use warden_core::{
    AuditResult, AuditStatus, AuditType, InMemoryBus, InMemoryRequestStore, MessageBus, Priority, WorkerBridge,
};
use warden_test_utils::{FakeHostProbe, ScriptedWorker};

struct Harness {
    bus: Arc<InMemoryBus>,
    store: Arc<InMemoryRequestStore>,
    history: Arc<InMemoryAuditHistory>,
    daemon: Arc<SeniorAuditDaemon>,
}

fn harness() -> Harness {
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryRequestStore::new());
    let history = Arc::new(InMemoryAuditHistory::new());
    let diagnostics = Arc::new(AuditDiagnostics::new(bus.clone(), Arc::new(FakeHostProbe::idle())));
    let daemon = SeniorAuditDaemon::new(bus.clone(), store.clone(), diagnostics, AuditConfig::default())
        .with_history(history.clone());
    Harness {
        bus,
        store,
        history,
        daemon: Arc::new(daemon),
    }
}

fn attach(bus: &Arc<InMemoryBus>, worker: Arc<ScriptedWorker>) -> CancellationToken {
    let cancel = CancellationToken::new();
    bus.declare_work_queue(subjects::AUDIT_REQUEST);
    WorkerBridge::spawn(bus.clone(), worker, cancel.clone());
    cancel
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_escalate_once() {
    let h = harness();
    let start = tokio::time::Instant::now();

    let err = h.daemon.run_audit(AuditType::full_system()).await.unwrap_err();

    let AuditError::Escalated {
        audit_id,
        attempts,
        ticket,
    } = &err
    else {
        panic!("expected escalation, got {err:?}");
    };
    assert_eq!(*attempts, 4);
    assert!(ticket.is_some());
    assert!(err.is_fatal());

    // 4 timeouts of 30 minutes plus backoff of 30, 60, and 120 seconds
    let elapsed = start.elapsed();
    let expected = Duration::from_secs(4 * 30 * 60 + 30 + 60 + 120);
    assert!(elapsed >= expected && elapsed < expected + Duration::from_secs(1), "{elapsed:?}");

    let published: Vec<String> = h
        .bus
        .history(subjects::AUDIT_REQUEST)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| m.dedup_key)
        .collect();
    assert_eq!(
        published,
        vec![
            audit_id.clone(),
            format!("{audit_id}-retry-1"),
            format!("{audit_id}-retry-2"),
            format!("{audit_id}-retry-3"),
        ]
    );

    let escalations: Vec<_> = h
        .store
        .created()
        .into_iter()
        .filter(|t| t.labels.iter().any(|l| l == "escalation"))
        .collect();
    assert_eq!(escalations.len(), 1);
    let escalation = &escalations[0];
    assert_eq!(escalation.priority, Priority::Critical);
    assert_eq!(escalation.assigned_to.as_deref(), Some("devops-engineer"));
    assert!(escalation.title.contains("medium severity"));
    assert!(escalation.description.contains("### Acceptance Criteria"));

    let p0 = h.bus.last_message(subjects::ESCALATION_P0).await.unwrap().unwrap();
    let body: serde_json::Value = p0.json().unwrap();
    assert_eq!(body["attempts"], 4);
    assert_eq!(body["probableCause"], "unknown/transient");
    assert!(h.daemon.correlator().is_empty());
    assert!(h.history.results().is_empty());
}

#[tokio::test]
async fn response_opens_tickets_and_requests_spawn() {
    let h = harness();
    let worker = Arc::new(ScriptedWorker::responding().with_status(AuditStatus::Warning).with_recommendations([
        "CRITICAL: rotate leaked deploy token",
        "LOW: tidy log retention",
        "add alerting on queue depth",
    ]));
    let cancel = attach(&h.bus, worker.clone());

    let result = h.daemon.run_audit(AuditType::full_system()).await.unwrap();

    assert_eq!(result.overall_status, AuditStatus::Warning);
    assert_eq!(worker.calls(), 1);
    assert_eq!(h.history.results(), vec![result.clone()]);

    let priorities: Vec<Priority> = h.store.created().iter().map(|t| t.priority).collect();
    assert_eq!(priorities, vec![Priority::Critical, Priority::Low, Priority::High]);

    let spawns = h.bus.history(subjects::SPAWN_REQUEST).await.unwrap();
    assert_eq!(spawns.len(), 1);
    let spawn: SpawnRequest = spawns[0].json().unwrap();
    assert_eq!(spawn.worker, "remediation-engineer");
    assert_eq!(spawn.reason, "CRITICAL: rotate leaked deploy token");

    let broadcast: AuditResult = h.bus.last_message(subjects::RESULTS).await.unwrap().unwrap().json().unwrap();
    assert_eq!(broadcast, result);
    assert!(!h.daemon.is_running());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn retry_uses_derived_id() {
    let h = harness();
    let worker = Arc::new(ScriptedWorker::responding().silent_for(1));
    let cancel = attach(&h.bus, worker.clone());

    let result = h.daemon.run_audit(AuditType::full_system()).await.unwrap();

    assert_eq!(result.overall_status, AuditStatus::Pass);
    let requests = worker.requests();
    assert_eq!(requests.len(), 2);
    let original = &requests[0].audit_request_id;
    assert_eq!(requests[1].audit_request_id, format!("{original}-retry-1"));
    assert_eq!(requests[1].original_request_id.as_deref(), Some(original.as_str()));
    assert_eq!(requests[1].attempt, 1);
    assert!(h.store.created().iter().all(|t| !t.labels.iter().any(|l| l == "escalation")));
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn late_response_after_timeout_is_dropped() {
    let h = harness();
    // Answers every request, but only after the 30 minute timeout
    let worker = Arc::new(ScriptedWorker::delayed(Duration::from_secs(45 * 60)));
    let cancel = attach(&h.bus, worker.clone());

    let err = h.daemon.run_audit(AuditType::full_system()).await.unwrap_err();
    assert!(matches!(err, AuditError::Escalated { attempts: 4, .. }));
    assert_eq!(worker.calls(), 4);
    assert!(h.history.results().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn timeout_adapts_to_history() {
    let h = harness();
    assert_eq!(
        h.daemon.adaptive_timeout(&AuditType::full_system()).await,
        Duration::from_secs(30 * 60)
    );

    for minutes in [30.0, 50.0] {
        h.history
            .record(&AuditResult {
                audit_type: AuditType::full_system(),
                timestamp: chrono::Utc::now(),
                duration_minutes: minutes,
                overall_status: AuditStatus::Pass,
                deployment_blocked: false,
                block_reasons: vec![],
                recommendations: vec![],
            })
            .await
            .unwrap();
    }
    assert_eq!(
        h.daemon.adaptive_timeout(&AuditType::full_system()).await,
        Duration::from_secs(60 * 60)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_audits_at_startup_and_on_trigger() {
    let h = harness();
    let worker = Arc::new(ScriptedWorker::responding());
    let worker_cancel = attach(&h.bus, worker.clone());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(h.daemon.clone().run(cancel.clone()));

    wait_for_results(&h.history, 1).await;
    h.bus.publish(subjects::AUDIT_TRIGGER, Vec::new(), None).await.unwrap();
    wait_for_results(&h.history, 2).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
    worker_cancel.cancel();
    assert_eq!(worker.calls(), 2);
    assert!(!h.daemon.is_running());
}

async fn wait_for_results(history: &InMemoryAuditHistory, n: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while history.results().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
