//! Shared wiring for the end-to-end tests: an in-memory configuration
//! store seeded with a small group hierarchy, the kernel, and a
//! manually driven execution engine.

// Each test binary uses its own slice of this module.
#![allow(dead_code)]

use catalog::config_store::ConfigStore;
use catalog::database::State;
use controller::{Reconciler, Scheduler, SchedulerConfig};
use coordinator::Dispatcher;
use coordinator::execution::{ExecutionEngine, ExecutionEvent, event_channel};
use model::config::{CreateResourceGroup, CreateSelector};
use model::group::SchedulingPolicy;
use model::query::query_state::QueryState;
use model::query::{QueryError, QueryId, QuerySubmission, QueryType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_ENVIRONMENT: &str = "test";

pub const GLOBAL: i64 = 1;
pub const BI: i64 = 2;
pub const USER: i64 = 3;
pub const ADHOC: i64 = 4;
pub const DASHBOARD: i64 = 5;
pub const EXPLAIN: i64 = 7;

pub struct TestKernel {
    pub store: Arc<ConfigStore>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<Reconciler>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<ManualEngine>,
}

/// Execution engine driven explicitly by the test: queries run until
/// the test finishes or fails them.
pub struct ManualEngine {
    events: flume::Sender<ExecutionEvent>,
    started: Mutex<Vec<QueryId>>,
    cancelled: Mutex<Vec<QueryId>>,
}

impl ManualEngine {
    fn new(events: flume::Sender<ExecutionEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    pub fn finish(&self, id: &QueryId) {
        self.events
            .send(ExecutionEvent::Finished(id.clone()))
            .expect("Dispatcher should be running");
    }

    pub fn fail(&self, id: &QueryId, error: QueryError) {
        self.events
            .send(ExecutionEvent::Failed {
                id: id.clone(),
                error,
            })
            .expect("Dispatcher should be running");
    }

    pub fn report_memory(&self, id: &QueryId, bytes: u64) {
        self.events
            .send(ExecutionEvent::MemoryUsage {
                id: id.clone(),
                bytes,
            })
            .expect("Dispatcher should be running");
    }

    pub fn started(&self) -> Vec<QueryId> {
        self.started.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<QueryId> {
        self.cancelled.lock().clone()
    }
}

impl ExecutionEngine for ManualEngine {
    fn start(&self, submission: &QuerySubmission) {
        self.started.lock().push(submission.id.clone());
    }

    fn cancel(&self, id: &QueryId) {
        self.cancelled.lock().push(id.clone());
    }
}

/// Group tree and selectors the reconfiguration tests start from:
///
/// ```text
/// global ── bi-${USER}
///        └─ user-${USER} ── adhoc-${USER}
///                        └─ dashboard-${USER}
/// explain
/// ```
async fn seed(store: &ConfigStore) {
    let groups = vec![
        CreateResourceGroup::new(GLOBAL, "global", "80%", "100%", 100, 100)
            .environment(TEST_ENVIRONMENT),
        CreateResourceGroup::new(BI, "bi-${USER}", "1MB", "10%", 10, 3)
            .parent(GLOBAL)
            .environment(TEST_ENVIRONMENT),
        CreateResourceGroup::new(USER, "user-${USER}", "1MB", "10%", 10, 3)
            .parent(GLOBAL)
            .scheduling_policy(SchedulingPolicy::RecentQueries)
            .environment(TEST_ENVIRONMENT),
        CreateResourceGroup::new(ADHOC, "adhoc-${USER}", "1MB", "10%", 3, 3)
            .parent(USER)
            .scheduling_policy(SchedulingPolicy::RecentQueries)
            .scheduling_weight(10)
            .environment(TEST_ENVIRONMENT),
        CreateResourceGroup::new(DASHBOARD, "dashboard-${USER}", "1MB", "10%", 1, 1)
            .parent(USER)
            .scheduling_policy(SchedulingPolicy::RecentQueries)
            .environment(TEST_ENVIRONMENT),
        CreateResourceGroup::new(EXPLAIN, "explain", "1MB", "10%", 10, 10)
            .environment(TEST_ENVIRONMENT),
    ];
    for group in groups {
        store
            .insert_resource_group(group)
            .await
            .expect("Seed group should insert");
    }

    let selectors = vec![
        CreateSelector::new(ADHOC, 1)
            .user_regex("user.*")
            .source_regex("(?i).*adhoc.*"),
        CreateSelector::new(BI, 2)
            .user_regex("user.*")
            .client_tags(["tag1"]),
        CreateSelector::new(DASHBOARD, 3)
            .user_regex("user.*")
            .source_regex("(?i).*dashboard.*"),
        CreateSelector::new(ADHOC, 4)
            .user_regex("user.*")
            .client_tags(["tag1", "tag2"]),
        CreateSelector::new(EXPLAIN, 5).query_type(QueryType::Explain),
    ];
    for selector in selectors {
        store
            .insert_selector(selector)
            .await
            .expect("Seed selector should insert");
    }
}

pub async fn test_kernel() -> TestKernel {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .without_time()
        .try_init();

    let store = ConfigStore::new(State::for_test().await, TEST_ENVIRONMENT);
    seed(&store).await;

    let scheduler = Scheduler::new(SchedulerConfig::default());
    let reconciler = Reconciler::new(store.clone(), scheduler.clone());
    reconciler
        .load()
        .await
        .expect("Seed configuration should apply");

    let (events_tx, events_rx) = event_channel();
    let engine = ManualEngine::new(events_tx);
    let dispatcher = Dispatcher::start(scheduler.clone(), engine.clone(), events_rx);

    TestKernel {
        store,
        scheduler,
        reconciler,
        dispatcher,
        engine,
    }
}

pub fn dashboard_session() -> QuerySubmission {
    QuerySubmission::new("user").source("dashboard")
}

pub fn adhoc_session() -> QuerySubmission {
    QuerySubmission::new("user").source("adhoc")
}

/// Matches no configured selector.
pub fn rejecting_session() -> QuerySubmission {
    QuerySubmission::new("user").source("none-such")
}

pub async fn wait_for_state(dispatcher: &Arc<Dispatcher>, id: &QueryId, expected: QueryState) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        let mut rx = dispatcher
            .subscribe(id)
            .expect("Query should be registered");
        loop {
            let current = *rx.borrow();
            if current == expected {
                return;
            }
            assert!(
                !current.is_terminal(),
                "Query {id} ended as {current} while waiting for {expected}: {:?}",
                dispatcher.get_state(id)
            );
            rx.changed().await.expect("State channel should stay open");
        }
    })
    .await;
    assert!(
        waited.is_ok(),
        "Timed out waiting for {expected}: {:?}",
        dispatcher.get_state(id)
    );
}
