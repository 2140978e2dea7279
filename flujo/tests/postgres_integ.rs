//! End-to-end scenario against a real Postgres. Run with a migrated database:
//!
//!     DATABASE_URL=postgres://... cargo test -- --ignored

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flujo::db::{DbConfig, SqlStore};
use flujo::lock::LockToken;
use flujo::reaper::Reaper;
use flujo::registry::SimpleWorkflowRegistryBuilder;
use flujo::router::EventRouter;
use flujo::state::State;
use flujo::store::WorkflowStore;
use flujo::worker::Worker;
use flujo::{
    Event, EventRecord, SubscriptionFilter, Uniqueness, Workflow, WorkflowContext, WorkflowError,
    WorkflowFactory, WorkflowId, WorkflowStatus,
};
use serde_json::json;
use std::sync::Arc;

struct PurchaseWorkflow {
    workflow_id: WorkflowId,
    context: WorkflowContext,
    scheduled_at: DateTime<Utc>,
    finished: bool,
    error_count: i32,
}

impl PurchaseWorkflow {
    fn new(order_no: &str) -> Self {
        Self {
            workflow_id: 0,
            context: json!({"order_no": order_no, "paid": false}),
            scheduled_at: Utc::now(),
            finished: false,
            error_count: 0,
        }
    }

    fn order_no(&self) -> String {
        self.context["order_no"].as_str().unwrap_or_default().to_string()
    }
}

impl Workflow for PurchaseWorkflow {
    fn id(&self) -> WorkflowId {
        self.workflow_id
    }

    fn set_id(&mut self, workflow_id: WorkflowId) {
        self.workflow_id = workflow_id;
    }

    fn workflow_type(&self) -> &str {
        "purchase"
    }

    fn context(&self) -> WorkflowContext {
        self.context.clone()
    }

    fn set_context(&mut self, context: WorkflowContext) {
        self.context = context;
    }

    fn set_error_count(&mut self, error_count: i32) {
        self.error_count = error_count;
    }

    fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    fn run(&mut self, events: &[EventRecord]) -> Result<(), WorkflowError> {
        if events.iter().any(|e| e.event_type == "order_paid") {
            self.context["paid"] = json!(true);
            self.mark_finished();
        } else {
            self.scheduled_at = Utc::now() + ChronoDuration::hours(12);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn mark_finished(&mut self) {
        self.finished = true;
    }

    fn exceeded_error_budget(&self) -> bool {
        self.error_count > 5
    }

    fn is_erroring(&self) -> bool {
        false
    }

    fn subscriptions(&self) -> Vec<SubscriptionFilter> {
        vec![SubscriptionFilter::new(
            "order_paid",
            "order_no",
            vec![self.order_no()],
        )]
    }

    fn uniqueness(&self) -> Option<Uniqueness> {
        Some(Uniqueness::new("order_no", &self.order_no()))
    }
}

struct PurchaseWorkflowFactory;

impl WorkflowFactory for PurchaseWorkflowFactory {
    fn create(&self) -> Box<dyn Workflow> {
        Box::new(PurchaseWorkflow::new(""))
    }

    fn workflow_type(&self) -> &str {
        "purchase"
    }
}

struct OrderPaidEvent {
    order_no: String,
}

impl Event for OrderPaidEvent {
    fn event_type(&self) -> &str {
        "order_paid"
    }

    fn context(&self) -> serde_json::Value {
        json!({"order_no": self.order_no})
    }

    fn routing_pairs(&self) -> Vec<(String, String)> {
        vec![("order_no".to_string(), self.order_no.clone())]
    }

    fn identity(&self) -> String {
        format!("order-{}", self.order_no)
    }
}

fn connect() -> State {
    let config = DbConfig::from_env().unwrap();
    let store = SqlStore::new(&config).unwrap();
    store.verify_schema().unwrap();
    State {
        store: Arc::new(store),
    }
}

#[test]
#[ignore]
fn purchase_workflow_runs_to_completion_on_postgres() {
    let _ = env_logger::try_init();
    let state = connect();
    let registry = SimpleWorkflowRegistryBuilder::default()
        .add_factory(PurchaseWorkflowFactory)
        .build();
    let token = LockToken::new("integ-host", std::process::id());
    let store = WorkflowStore::new_with_token(state.clone(), registry.clone(), token.clone());
    let worker = Worker::new_with_token(state.clone(), registry, token);
    let router = EventRouter::new(state.clone());

    // A fresh fingerprint per run keeps reruns against the same database
    // independent.
    let order_no = format!("po-{}-{}", std::process::id(), Utc::now().timestamp_millis());
    let mut workflow = PurchaseWorkflow::new(&order_no);
    let workflow_id = store.create(&mut workflow, true).unwrap().unwrap();
    assert!(store
        .create(&mut PurchaseWorkflow::new(&order_no), true)
        .unwrap()
        .is_none());

    let now = Utc::now() + ChronoDuration::seconds(1);
    assert!(worker.run_once(now).unwrap() >= 1);
    let record = state.store.fetch_workflow_any(workflow_id).unwrap().unwrap();
    assert_eq!(WorkflowStatus::Active, record.status);
    assert_eq!("", record.lock);

    let paid = OrderPaidEvent {
        order_no: order_no.clone(),
    };
    let routed = router.route(&paid, now + ChronoDuration::seconds(1)).unwrap();
    assert_eq!(1, routed);
    assert!(worker.run_once(now + ChronoDuration::seconds(2)).unwrap() >= 1);

    let record = state.store.fetch_workflow_any(workflow_id).unwrap().unwrap();
    assert_eq!(WorkflowStatus::Finished, record.status);
    assert_eq!(json!(true), record.context["paid"]);
    assert!(state.store.open_events(workflow_id).unwrap().is_empty());
    assert!(!state.store.uniqueness_exists("order_no", &order_no).unwrap());
}

#[test]
#[ignore]
fn stale_lock_is_reclaimed_on_postgres() {
    let _ = env_logger::try_init();
    let state = connect();
    let token = LockToken::new("integ-host", std::process::id());

    let order_no = format!("rc-{}-{}", std::process::id(), Utc::now().timestamp_millis());
    let registry = SimpleWorkflowRegistryBuilder::default()
        .add_factory(PurchaseWorkflowFactory)
        .build();
    let store = WorkflowStore::new_with_token(state.clone(), registry, token.clone());
    let mut workflow = PurchaseWorkflow::new(&order_no);
    let workflow_id = store.create(&mut workflow, false).unwrap().unwrap();

    // A process on a host with no heartbeat died holding the lock.
    let stale_since = Utc::now() - ChronoDuration::minutes(20);
    assert!(state
        .store
        .lock_workflow(workflow_id, "ghost-host:99", stale_since)
        .unwrap());

    let reaper = Reaper::new_with_token(state.clone(), token, ChronoDuration::minutes(10));
    let stats = reaper.sweep(Utc::now()).unwrap();
    assert!(stats.restarted >= 1);

    let record = state.store.fetch_workflow_any(workflow_id).unwrap().unwrap();
    assert_eq!(WorkflowStatus::Active, record.status);
    assert_eq!("", record.lock);
}
