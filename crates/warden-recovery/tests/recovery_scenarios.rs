use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use warden_core::bus::subjects;
use warden_core::config::RecoveryConfig;
use warden_core::{InMemoryBus, InMemoryRequestStore, MessageBus, Phase, Pipeline, RequestId};
use warden_recovery::{HealthStatus, RecoveryAction, RecoveryDaemon, RequestRecovery, StageTracker};
use warden_test_utils::{complete_stages, in_progress, publish_completion, FlakyStore};

fn daemon(store: Arc<dyn warden_core::RequestStore>, bus: Arc<InMemoryBus>) -> RecoveryDaemon {
    RecoveryDaemon::new(store, bus, Pipeline::default(), RecoveryConfig::default())
}

#[tokio::test]
async fn partial_progress_resumes_at_next_stage() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryRequestStore::with_requests([
        in_progress("REQ-A", Duration::hours(5)).with_assignee("critic"),
    ]));
    complete_stages(bus.as_ref(), &Pipeline::default(), "REQ-A", 2, now - Duration::hours(2)).await;

    let report = daemon(store.clone(), bus).check_at(now).await;

    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(
        report.recoveries,
        vec![RequestRecovery {
            request_id: RequestId::new("REQ-A"),
            stuck_minutes: 120,
            action: RecoveryAction::Rescheduled {
                last_completed: Some("critique".into()),
                next_stage: "backend".into(),
            },
        }]
    );
    let request = store.get(&RequestId::new("REQ-A")).unwrap();
    assert_eq!(request.phase, Phase::Backlog);
    assert_eq!(request.assigned_to.as_deref(), Some("backend-developer"));
    assert!(!request.is_blocked);
}

#[tokio::test]
async fn nothing_completed_restarts_from_first_stage() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryRequestStore::with_requests([
        in_progress("REQ-B", Duration::hours(2)).with_assignee("researcher"),
    ]));

    let report = daemon(store.clone(), bus).check_at(now).await;

    assert_eq!(
        report.recoveries[0].action,
        RecoveryAction::Rescheduled {
            last_completed: None,
            next_stage: "research".into(),
        }
    );
    let request = store.get(&RequestId::new("REQ-B")).unwrap();
    assert_eq!(request.phase, Phase::Backlog);
    assert_eq!(request.assigned_to, None);
}

#[tokio::test]
async fn all_stages_completed_marks_done() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let pipeline = Pipeline::default();
    let store = Arc::new(InMemoryRequestStore::with_requests([in_progress("REQ-C", Duration::hours(9))]));
    complete_stages(bus.as_ref(), &pipeline, "REQ-C", pipeline.len(), now - Duration::hours(3)).await;

    let report = daemon(store.clone(), bus).check_at(now).await;

    assert_eq!(report.recoveries[0].action, RecoveryAction::Completed);
    assert_eq!(store.get(&RequestId::new("REQ-C")).unwrap().phase, Phase::Done);
}

#[tokio::test]
async fn recent_completion_is_not_stuck() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryRequestStore::with_requests([in_progress("REQ-D", Duration::hours(6))]));
    complete_stages(bus.as_ref(), &Pipeline::default(), "REQ-D", 1, now - Duration::minutes(20)).await;

    let report = daemon(store.clone(), bus).check_at(now).await;

    assert_eq!(report.examined, 1);
    assert!(report.recoveries.is_empty());
    assert_eq!(store.get(&RequestId::new("REQ-D")).unwrap().phase, Phase::InProgress);
}

#[tokio::test]
async fn failed_recovery_blocks_with_reason() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(FlakyStore::new([in_progress("REQ-E", Duration::hours(2))]));
    store.reject_updates_to(Phase::Backlog);

    let report = daemon(store.clone(), bus).check_at(now).await;

    assert_eq!(report.blocked, 1);
    assert_eq!(report.status, HealthStatus::Degraded);
    let request = store.inner().get(&RequestId::new("REQ-E")).unwrap();
    assert_eq!(request.phase, Phase::Blocked);
    assert!(request.is_blocked);
    assert!(request.blocked_reason.unwrap().contains("automatic recovery failed"));
}

#[tokio::test]
async fn more_than_three_blocked_is_critical() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(FlakyStore::new(
        (0..4).map(|i| in_progress(&format!("REQ-{i}"), Duration::hours(2))),
    ));
    store.reject_updates_to(Phase::Backlog);

    let report = daemon(store, bus).check_at(now).await;

    assert_eq!(report.blocked, 4);
    assert_eq!(report.status, HealthStatus::Critical);
}

#[tokio::test]
async fn store_outage_degrades_to_critical() {
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(FlakyStore::default());
    store.fail_listing(true);

    let report = daemon(store, bus).check().await;

    assert_eq!(report.status, HealthStatus::Critical);
    assert!(report.error.is_some());
}

#[tokio::test]
async fn orphaned_deliverables_degrade_health() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryRequestStore::new());
    for i in 0..11 {
        publish_completion(bus.as_ref(), "qa-engineer", "qa", &format!("GONE-{i}"), now).await;
    }

    let report = daemon(store, bus).check_at(now).await;

    assert_eq!(report.orphaned_deliverables, 11);
    assert_eq!(report.status, HealthStatus::Degraded);
}

#[tokio::test]
async fn report_is_broadcast_with_tracker_details() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let mut results = bus.subscribe(subjects::RESULTS).await.unwrap();
    let tracker = StageTracker::new(Pipeline::default(), 10).shared();
    tracker
        .lock()
        .enter_stage_at(RequestId::new("REQ-T"), "qa", now - Duration::minutes(50));

    let report = daemon(Arc::new(InMemoryRequestStore::new()), bus.clone())
        .with_tracker(tracker)
        .check_at(now)
        .await;

    assert_eq!(report.stuck_stages.len(), 1);
    assert_eq!(report.stuck_stages[0].stage, "qa");

    let message = results.next().await.unwrap();
    let broadcast: serde_json::Value = message.json().unwrap();
    assert_eq!(broadcast["status"], "healthy");
    assert_eq!(broadcast["stuck_stages"][0]["request_id"], "REQ-T");
}

#[tokio::test]
async fn recovered_requests_leave_the_stage_tracker() {
    let now = Utc::now();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(FlakyStore::new([
        in_progress("REQ-R", Duration::hours(3)),
        in_progress("REQ-X", Duration::hours(3)),
    ]));
    store.reject_updates_for(&RequestId::new("REQ-X"));
    let tracker = StageTracker::new(Pipeline::default(), 10).shared();
    for id in ["REQ-R", "REQ-X"] {
        tracker
            .lock()
            .enter_stage_at(RequestId::new(id), "research", now - Duration::hours(3));
    }
    let daemon = daemon(store, bus).with_tracker(tracker.clone());

    let report = daemon.check_at(now).await;
    assert_eq!(report.recoveries.len(), 2);
    assert!(report.stuck_stages.is_empty());
    assert_eq!(tracker.lock().open_count(), 0);

    let later = daemon.check_at(now + Duration::hours(10)).await;
    assert!(later.stuck_stages.is_empty());
}

#[tokio::test]
async fn manual_trigger_runs_a_sweep() {
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryRequestStore::new());
    let mut results = bus.subscribe(subjects::RESULTS).await.unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();

    let daemon = Arc::new(daemon(store.clone(), bus.clone()));
    let handle = tokio::spawn(daemon.run(cancel.clone()));

    let startup: serde_json::Value = results.next().await.unwrap().json().unwrap();
    assert_eq!(startup["examined"], 0);

    store.insert(in_progress("REQ-M", Duration::hours(3)));
    bus.publish(subjects::RECOVERY_TRIGGER, b"{}".to_vec(), None).await.unwrap();
    let second: serde_json::Value = results.next().await.unwrap().json().unwrap();
    assert_eq!(second["examined"], 1);

    cancel.cancel();
    handle.await.unwrap();
}
