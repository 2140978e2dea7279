use crate::diag::DiagnosticLog;
use crate::lock::LockToken;
use crate::state::State;
use crate::store::WorkflowStore;
use crate::{StoreResult, WorkflowId, WorkflowRegistry};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Most due workflows one pass picks up.
const DUE_BATCH_SIZE: i64 = 50;

/// Drives due workflows through one execution round each: lock, reconstruct,
/// hand over the open events, persist the outcome, unlock.
///
/// Any number of workers on any number of hosts can run against the same
/// store; the conditional lock update guarantees one executor per workflow
/// per round.
pub struct Worker {
    store: WorkflowStore,
    diag: DiagnosticLog,
}

impl Worker {
    pub fn new(state: State, registry: Arc<dyn WorkflowRegistry>) -> StoreResult<Self> {
        let token = LockToken::local()?;
        Ok(Self::new_with_token(state, registry, token))
    }

    pub fn new_with_token(
        state: State,
        registry: Arc<dyn WorkflowRegistry>,
        token: LockToken,
    ) -> Self {
        let diag = DiagnosticLog::new(state.clone(), &token);
        let store = WorkflowStore::new_with_token(state, registry, token);
        Self { store, diag }
    }

    /// One polling pass. Returns how many workflows this process executed.
    ///
    /// A workflow lost to contention is skipped silently; a workflow whose
    /// round fails is logged and left for a later pass. Only fatal store
    /// errors propagate.
    pub fn run_once(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let due = self.store.list_due("", now, DUE_BATCH_SIZE)?;
        if due.is_empty() {
            return Ok(0);
        }
        info!("Fetched {} due workflows", due.len());
        let mut executed = 0;
        for workflow_id in due {
            match self.run_one(workflow_id, now) {
                Ok(true) => executed += 1,
                Ok(false) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    // This is OK, the workflow will be retried on a later pass.
                    error!(
                        "workflow round failed. workflow_id={:?} error={:?}",
                        workflow_id, err
                    );
                }
            }
        }
        Ok(executed)
    }

    fn run_one(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut workflow = match self.store.get(workflow_id, now)? {
            Some(workflow) => workflow,
            None => {
                debug!(
                    "workflow is locked elsewhere or gone. workflow_id={:?}",
                    workflow_id
                );
                return Ok(false);
            }
        };
        // Reconstruction may have already decided the workflow is done, e.g.
        // past its error budget. No round runs in that case.
        if !workflow.is_finished() {
            let events = self.store.open_events(workflow_id)?;
            if let Err(err) = workflow.run(&events) {
                warn!(
                    "workflow round returned an error. workflow_id={:?} retriable={:?} error={:?}",
                    workflow_id, err.retriable, err
                );
                self.diag
                    .append(workflow_id, format!("round failed: {}", err));
            }
        }
        let finished = workflow.is_finished();
        self.store.save(workflow.as_ref(), true, now)?;
        if finished {
            self.diag.append(workflow_id, "workflow finished");
        }
        Ok(true)
    }

    /// Moves the worker onto its own thread, polling every `interval` while
    /// idle and continuously while there is work.
    pub fn start(self, interval: Duration) -> WorkerHandle {
        let worker = Arc::new(self);
        let stop: Arc<AtomicU8> = Arc::new(AtomicU8::new(0));
        let stop_clone = stop.clone();
        thread::spawn(move || {
            while stop_clone.load(Ordering::SeqCst) == 0 {
                info!("Starting worker thread");
                // In case the polling thread crashes we can restart it
                // without blocking the embedding application.
                let worker_clone = worker.clone();
                let stop_clone_clone = stop_clone.clone();
                let handle = thread::spawn(move || {
                    while stop_clone_clone.load(Ordering::SeqCst) == 0 {
                        match worker_clone.run_once(Utc::now()) {
                            Ok(0) => thread::sleep(interval),
                            Ok(_) => {}
                            Err(err) => {
                                error!("worker pass failed. error={:?}", err);
                                thread::sleep(interval);
                            }
                        }
                    }
                });
                if let Err(err) = handle.join() {
                    if let Some(msg) = err.downcast_ref::<String>() {
                        error!("Worker thread panicked: {:?}", msg);
                    } else {
                        error!("Worker thread panicked with unexpected error: {:?}", err);
                    }
                    thread::sleep(Duration::from_secs(1));
                } else {
                    error!("Polling has stopped");
                }
            }
            stop_clone.store(2, Ordering::SeqCst);
        });
        WorkerHandle { stop_flag: stop }
    }
}

#[derive(Clone)]
pub struct WorkerHandle {
    stop_flag: Arc<AtomicU8>,
}

impl WorkerHandle {
    /// Signals the worker thread to stop and waits for the acknowledgement.
    /// False when the thread did not acknowledge within the bounded wait.
    pub fn stop(&self) -> bool {
        info!("Stopping worker");
        self.stop_flag.store(1, Ordering::SeqCst);
        for _ in 0..1000 {
            if self.stop_flag.load(Ordering::SeqCst) == 2 {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        error!("Worker thread did not stop");
        false
    }
}
