use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use vigil_poller::backend::{Backend, BackendError, QueryOutcome};
use vigil_poller::dispatch::{DispatchError, Dispatcher};
use vigil_poller::format::EventRequest;
use vigil_poller::store::{
    Adapter, CycleStatus, MatchRule, MemoryStore, PollCycleRecord, TriggerKey, TriggerStore,
};
use vigil_poller::supervisor::Supervisor;
use vigil_poller::trigger::TriggerDiff;
use vigil_poller::worker::{AdapterWorker, CycleOutcome};

const HOST: &str = "test-host";

struct FakeBackend {
    payload: Option<Value>,
    conflict: bool,
    fail: bool,
}

impl FakeBackend {
    fn payload(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            conflict: false,
            fail: false,
        }
    }

    fn conflict() -> Self {
        Self {
            payload: None,
            conflict: true,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            payload: None,
            conflict: false,
            fail: true,
        }
    }
}

#[async_trait::async_trait]
impl Backend for FakeBackend {
    async fn query(
        &self,
        _adapter: &Adapter,
        _window_start: f64,
        _window_end: f64,
    ) -> Result<QueryOutcome, BackendError> {
        if self.fail {
            return Err(BackendError::Transport("connection refused".into()));
        }
        if self.conflict {
            return Ok(QueryOutcome::Conflict);
        }
        Ok(QueryOutcome::Payload(
            self.payload.clone().expect("payload configured"),
        ))
    }
}

#[derive(Default)]
struct FakeDispatcher {
    sent: Mutex<Vec<Vec<EventRequest>>>,
    fail: bool,
}

impl FakeDispatcher {
    fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn batches(&self) -> Vec<Vec<EventRequest>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Dispatcher for FakeDispatcher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(&self, batch: &[EventRequest]) -> Result<(), DispatchError> {
        if self.fail {
            return Err(DispatchError("downstream unavailable".into()));
        }
        self.sent.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn sample_adapter(id: i64) -> Adapter {
    Adapter {
        id,
        name: format!("adapter-{id}"),
        uri: "http://backend.local/api/v1/query_range".into(),
        username: String::new(),
        password: String::new(),
        metric: "alerts".into(),
        evtime_path: "data.alerts.[].at".into(),
        instance_path: "data.alerts.[].host".into(),
        rule_type_id: 7,
        busy: false,
        last_update_ms: 1_000,
    }
}

fn two_column_rules(store: &MemoryStore, adapter_id: i64) {
    store.insert_match_rule(MatchRule {
        id: 1,
        adapter_id,
        response_key: "data.alerts.[].severity".into(),
    });
    store.insert_match_rule(MatchRule {
        id: 2,
        adapter_id,
        response_key: "data.alerts.[].message".into(),
    });
}

fn two_alert_payload() -> Value {
    json!({
        "data": {
            "alerts": [
                {"host": "web-1", "at": 1_700_000_000, "severity": "critical", "message": "disk full"},
                {"host": "web-2", "at": 1_700_000_100, "severity": "warning", "message": "cpu high"}
            ]
        }
    })
}

fn build_worker(
    store: &MemoryStore,
    backend: FakeBackend,
    dispatcher: Arc<FakeDispatcher>,
) -> AdapterWorker {
    AdapterWorker::new(
        Arc::new(store.clone()),
        TriggerDiff::new(Arc::new(store.clone())),
        Arc::new(backend),
        dispatcher,
        HOST.into(),
    )
}

fn single_cycle(store: &MemoryStore, adapter_id: i64) -> PollCycleRecord {
    let cycles = store.cycles_for(adapter_id);
    assert_eq!(cycles.len(), 1, "expected exactly one cycle record");
    cycles.into_iter().next().unwrap()
}

#[tokio::test]
async fn new_event_dispatched_and_cycle_completed() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    two_column_rules(&store, 1);

    // web-1's occurrence was reported by an earlier poll.
    store
        .record(
            1,
            &[TriggerKey {
                instance: "web-1".into(),
                event_time: 1_700_000_000.0,
            }],
        )
        .await
        .unwrap();

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(two_alert_payload()), dispatcher.clone());

    let outcome = worker.run_cycle(1).await;
    assert_eq!(outcome, CycleOutcome::Completed { dispatched: 1 });

    let batches = dispatcher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    let request = &batches[0][0];
    assert_eq!(request.instance, "web-2");
    assert_eq!(request.event_time, 1_700_000_100.0);
    assert_eq!(request.rule_type_id, 7);
    assert_eq!(request.event_info, vec![json!("warning"), json!("cpu high")]);

    let cycle = single_cycle(&store, 1);
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert!(cycle.cursor > 1.0, "cursor advances to the cycle's now");
    assert!(!store.adapter(1).unwrap().busy);
}

#[tokio::test]
async fn second_cycle_sees_nothing_new() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    two_column_rules(&store, 1);

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(two_alert_payload()), dispatcher.clone());

    assert_eq!(
        worker.run_cycle(1).await,
        CycleOutcome::Completed { dispatched: 2 }
    );
    assert_eq!(
        worker.run_cycle(1).await,
        CycleOutcome::Completed { dispatched: 0 }
    );
    assert_eq!(dispatcher.batches().len(), 1);
}

#[tokio::test]
async fn empty_window_completes_without_dispatch() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    two_column_rules(&store, 1);

    let payload = json!({"data": {"alerts": []}});
    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(payload), dispatcher.clone());

    assert_eq!(
        worker.run_cycle(1).await,
        CycleOutcome::Completed { dispatched: 0 }
    );
    assert!(dispatcher.batches().is_empty());
    assert_eq!(single_cycle(&store, 1).status, CycleStatus::Completed);
}

#[tokio::test]
async fn mismatched_diff_key_lengths_close_error() {
    let store = MemoryStore::new();
    let mut adapter = sample_adapter(1);
    // Event-time path resolves to one scalar while instances fan out to two.
    adapter.evtime_path = "data.checked_at".into();
    store.insert_adapter(adapter);
    two_column_rules(&store, 1);

    let payload = json!({
        "data": {
            "checked_at": 1_700_000_000,
            "alerts": [
                {"host": "web-1", "severity": "critical", "message": "m1"},
                {"host": "web-2", "severity": "warning", "message": "m2"}
            ]
        }
    });
    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(payload), dispatcher.clone());

    assert_eq!(worker.run_cycle(1).await, CycleOutcome::Failed);
    assert!(dispatcher.batches().is_empty());
    assert_eq!(single_cycle(&store, 1).status, CycleStatus::Error);
    assert!(!store.adapter(1).unwrap().busy);
}

#[tokio::test]
async fn unequal_event_info_columns_close_error() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    store.insert_match_rule(MatchRule {
        id: 1,
        adapter_id: 1,
        response_key: "data.alerts.[].severity".into(),
    });
    // Second column resolves to a single value, disagreeing with the first.
    store.insert_match_rule(MatchRule {
        id: 2,
        adapter_id: 1,
        response_key: "data.source".into(),
    });

    let payload = json!({
        "data": {
            "source": "prod",
            "alerts": [
                {"host": "web-1", "at": 1_700_000_000, "severity": "critical"},
                {"host": "web-2", "at": 1_700_000_100, "severity": "warning"}
            ]
        }
    });
    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(payload), dispatcher.clone());

    assert_eq!(worker.run_cycle(1).await, CycleOutcome::Failed);
    assert!(dispatcher.batches().is_empty());
    assert_eq!(single_cycle(&store, 1).status, CycleStatus::Error);
}

#[tokio::test]
async fn unresolvable_extraction_path_closes_error() {
    let store = MemoryStore::new();
    let mut adapter = sample_adapter(1);
    adapter.instance_path = "data.alerts.[].hostname".into();
    store.insert_adapter(adapter);
    two_column_rules(&store, 1);

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(two_alert_payload()), dispatcher);

    assert_eq!(worker.run_cycle(1).await, CycleOutcome::Failed);
    assert_eq!(single_cycle(&store, 1).status, CycleStatus::Error);
}

#[tokio::test]
async fn transport_failure_closes_error() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::failing(), dispatcher);

    assert_eq!(worker.run_cycle(1).await, CycleOutcome::Failed);
    assert_eq!(single_cycle(&store, 1).status, CycleStatus::Error);
    assert!(!store.adapter(1).unwrap().busy);
}

#[tokio::test]
async fn dispatch_failure_still_leaves_terminal_cycle() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    two_column_rules(&store, 1);

    let dispatcher = Arc::new(FakeDispatcher::failing());
    let worker = build_worker(&store, FakeBackend::payload(two_alert_payload()), dispatcher);

    assert_eq!(worker.run_cycle(1).await, CycleOutcome::Failed);

    let cycle = single_cycle(&store, 1);
    assert_eq!(cycle.status, CycleStatus::Error);
    assert!(!store.adapter(1).unwrap().busy);
}

#[tokio::test]
async fn backend_conflict_yields_without_error() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::conflict(), dispatcher.clone());

    assert_eq!(worker.run_cycle(1).await, CycleOutcome::Yielded);
    assert!(dispatcher.batches().is_empty());

    let cycle = single_cycle(&store, 1);
    assert_eq!(cycle.status, CycleStatus::Completed);
    // Cursor stays on the prior watermark; the claiming poller owns the window.
    assert_eq!(cycle.cursor, 1.0);
    assert!(store.adapter(1).unwrap().busy, "claim stays with the other poller");
}

#[tokio::test]
async fn supervisor_skips_busy_adapters() {
    let store = MemoryStore::new();
    store.insert_adapter(Adapter {
        busy: true,
        ..sample_adapter(1)
    });

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = Arc::new(build_worker(
        &store,
        FakeBackend::payload(json!({"data": {"alerts": []}})),
        dispatcher,
    ));
    let supervisor = Supervisor::new(
        Arc::new(store.clone()),
        worker,
        Duration::from_millis(10),
        HOST.into(),
    );

    supervisor.run().await.unwrap();
    assert!(store.cycles_for(1).is_empty());
}

#[tokio::test]
async fn supervisor_runs_workers_and_reaps() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    store.insert_adapter(sample_adapter(2));
    two_column_rules(&store, 1);
    two_column_rules(&store, 2);

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = Arc::new(build_worker(
        &store,
        FakeBackend::payload(two_alert_payload()),
        dispatcher.clone(),
    ));
    let supervisor = Supervisor::new(
        Arc::new(store.clone()),
        worker,
        Duration::from_millis(10),
        HOST.into(),
    );

    supervisor.run().await.unwrap();

    assert_eq!(single_cycle(&store, 1).status, CycleStatus::Completed);
    assert_eq!(single_cycle(&store, 2).status, CycleStatus::Completed);
    // Trigger state is adapter-scoped, so both adapters report both alerts.
    assert_eq!(dispatcher.batches().len(), 2);
}

#[tokio::test]
async fn crashed_cycle_is_force_closed_before_respawn() {
    let store = MemoryStore::new();
    store.insert_adapter(Adapter {
        busy: true,
        ..sample_adapter(1)
    });
    // Orphan left by a worker that died without closing its record.
    store.insert_cycle(PollCycleRecord {
        id: "orphan".into(),
        adapter_id: 1,
        status: CycleStatus::InProgress,
        cursor: 50.0,
        host: HOST.into(),
        updated_at_ms: 0,
    });

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = Arc::new(build_worker(
        &store,
        FakeBackend::payload(json!({"data": {"alerts": []}})),
        dispatcher,
    ));
    let supervisor = Supervisor::new(
        Arc::new(store.clone()),
        worker,
        Duration::from_millis(10),
        HOST.into(),
    );

    supervisor.run().await.unwrap();

    let mut cycles = store.cycles_for(1);
    cycles.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(cycles.len(), 2, "orphan plus the fresh cycle");

    let orphan = cycles.iter().find(|c| c.id == "orphan").unwrap();
    assert_eq!(orphan.status, CycleStatus::ForceClosed);

    let fresh = cycles.iter().find(|c| c.id != "orphan").unwrap();
    assert_eq!(fresh.status, CycleStatus::Completed);
}

#[tokio::test]
async fn orphans_of_other_hosts_left_alone() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    store.insert_cycle(PollCycleRecord {
        id: "foreign".into(),
        adapter_id: 9,
        status: CycleStatus::InProgress,
        cursor: 50.0,
        host: "some-other-host".into(),
        updated_at_ms: 0,
    });

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = Arc::new(build_worker(
        &store,
        FakeBackend::payload(json!({"data": {"alerts": []}})),
        dispatcher,
    ));
    let supervisor = Supervisor::new(
        Arc::new(store.clone()),
        worker,
        Duration::from_millis(10),
        HOST.into(),
    );

    supervisor.run().await.unwrap();
    assert_eq!(store.cycles_for(9)[0].status, CycleStatus::InProgress);
}

#[tokio::test]
async fn cursor_carries_between_cycles() {
    let store = MemoryStore::new();
    store.insert_adapter(sample_adapter(1));
    two_column_rules(&store, 1);

    let dispatcher = Arc::new(FakeDispatcher::default());
    let worker = build_worker(&store, FakeBackend::payload(two_alert_payload()), dispatcher);

    worker.run_cycle(1).await;
    let first_cursor = single_cycle(&store, 1).cursor;

    worker.run_cycle(1).await;
    let cycles = store.cycles_for(1);
    assert_eq!(cycles.len(), 2);
    for cycle in &cycles {
        assert_eq!(cycle.status, CycleStatus::Completed);
        assert!(cycle.cursor >= first_cursor);
    }
}
