use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, Utc};
use demo::{OrderEvent, OrderFulfilmentWorkflow, OrderFulfilmentWorkflowFactory};
use flujo::reaper::Reaper;
use flujo::registry::SimpleWorkflowRegistryBuilder;
use flujo::router::EventRouter;
use flujo::state::{InMemoryStore, State};
use flujo::store::WorkflowStore;
use flujo::worker::Worker;
use flujo::WorkflowStatus;
use log::info;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::init();

    let state = State {
        store: Arc::new(InMemoryStore::default()),
    };
    let registry = SimpleWorkflowRegistryBuilder::default()
        .add_factory(OrderFulfilmentWorkflowFactory)
        .build();
    let store = WorkflowStore::new(state.clone(), registry.clone())?;
    let router = EventRouter::new(state.clone());

    let mut workflow = OrderFulfilmentWorkflow::new("PO-1001", "EU");
    let workflow_id = match store.create(&mut workflow, true)? {
        Some(id) => id,
        None => bail!("order PO-1001 already exists"),
    };
    info!("created order workflow. workflow_id={}", workflow_id);

    // The same order number is refused while the first workflow lives.
    if store
        .create(&mut OrderFulfilmentWorkflow::new("PO-1001", "EU"), true)?
        .is_none()
    {
        info!("duplicate of order PO-1001 suppressed");
    }

    let worker = Worker::new(state.clone(), registry)?.start(Duration::from_millis(50));
    let reaper =
        Reaper::new(state.clone(), ChronoDuration::minutes(10))?.start(Duration::from_secs(1));

    // An order from a region nobody watches parks under the sentinel row.
    router.route(&OrderEvent::new("PO-9099", "US"), Utc::now())?;

    // Give the first execution round a chance to park the workflow, then
    // deliver the order it subscribed to.
    thread::sleep(Duration::from_millis(200));
    router.route(&OrderEvent::new("PO-1001", "EU"), Utc::now())?;

    let mut status = None;
    for _ in 0..100 {
        let record = match state.store.fetch_workflow_any(workflow_id)? {
            Some(record) => record,
            None => bail!("workflow row disappeared"),
        };
        if record.status == WorkflowStatus::Finished {
            status = Some(record.status);
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    if !worker.stop() || !reaper.stop() {
        bail!("background threads did not stop cleanly");
    }
    match status {
        Some(status) => info!("order fulfilled. workflow_id={} status={:?}", workflow_id, status),
        None => bail!("workflow did not finish in time"),
    }
    Ok(())
}
