use crate::lock::{LockManager, LockToken};
use crate::state::{NewWorkflowRecord, State, WorkflowCheckpoint};
use crate::subscriptions::SubscriptionIndex;
use crate::{EventRecord, StoreResult, Workflow, WorkflowId, WorkflowRecord, WorkflowRegistry};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Facade over workflow persistence: creation with optional uniqueness,
/// locked reconstruction, checkpoint saves and the due list.
pub struct WorkflowStore {
    state: State,
    registry: Arc<dyn WorkflowRegistry>,
    locks: LockManager,
    subscriptions: SubscriptionIndex,
}

impl WorkflowStore {
    pub fn new(state: State, registry: Arc<dyn WorkflowRegistry>) -> StoreResult<Self> {
        let token = LockToken::local()?;
        Ok(Self::new_with_token(state, registry, token))
    }

    pub fn new_with_token(
        state: State,
        registry: Arc<dyn WorkflowRegistry>,
        token: LockToken,
    ) -> Self {
        let locks = LockManager::new_with_token(state.clone(), token);
        let subscriptions = SubscriptionIndex::new(state.clone());
        Self {
            state,
            registry,
            locks,
            subscriptions,
        }
    }

    pub fn lock_token(&self) -> &LockToken {
        self.locks.token()
    }

    /// Persists a new workflow together with its subscription rows in one
    /// transaction and injects the generated id back into the collaborator.
    ///
    /// With `unique`, a live fingerprint for the workflow's uniqueness pair
    /// makes this call a duplicate: `Ok(None)` and nothing is written. The
    /// fingerprint row itself is inserted inside the same transaction as the
    /// workflow, so a failed create leaves no half-registered state.
    pub fn create(
        &self,
        workflow: &mut dyn Workflow,
        unique: bool,
    ) -> StoreResult<Option<WorkflowId>> {
        let fingerprint = if unique { workflow.uniqueness() } else { None };
        if let Some(ref uniqueness) = fingerprint {
            if self.subscriptions.uniqueness_exists(uniqueness)? {
                log::info!(
                    "duplicate workflow suppressed. workflow_type={:?} key={:?} value={:?}",
                    workflow.workflow_type(),
                    uniqueness.key,
                    uniqueness.value
                );
                return Ok(None);
            }
        }
        let mut rows = SubscriptionIndex::expand(0, &workflow.subscriptions());
        if let Some(ref uniqueness) = fingerprint {
            rows.push(SubscriptionIndex::uniqueness_row(0, uniqueness));
        }
        let record = NewWorkflowRecord {
            workflow_type: workflow.workflow_type().to_string(),
            context: workflow.context(),
            scheduled_at: workflow.scheduled_at(),
        };
        let workflow_id = self.state.store.insert_workflow(record, rows)?;
        workflow.set_id(workflow_id);
        Ok(Some(workflow_id))
    }

    /// Locks and reconstructs a workflow for execution.
    ///
    /// `None` covers a missing row and a lock held by another process alike.
    /// When this process already holds the lock the token-constrained read
    /// still matches, so the call is reentrant.
    pub fn get(
        &self,
        workflow_id: WorkflowId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Box<dyn Workflow>>> {
        self.locks.acquire(workflow_id, now)?;
        let record = match self
            .state
            .store
            .fetch_workflow(workflow_id, &self.locks.token().encode())?
        {
            Some(record) => record,
            None => return Ok(None),
        };
        self.reconstruct(record, true)
    }

    /// Reconstructs a workflow without taking its lock. Read-only callers
    /// must not save what they get here.
    pub fn get_without_lock(
        &self,
        workflow_id: WorkflowId,
    ) -> StoreResult<Option<Box<dyn Workflow>>> {
        let record = match self.state.store.fetch_workflow_any(workflow_id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        self.reconstruct(record, false)
    }

    fn reconstruct(
        &self,
        record: WorkflowRecord,
        locked: bool,
    ) -> StoreResult<Option<Box<dyn Workflow>>> {
        let mut workflow = match self.registry.create_workflow(&record.workflow_type) {
            Ok(workflow) => workflow,
            Err(err) => {
                // A row we cannot reconstruct must not stay locked under our
                // token until the reaper notices it.
                if locked {
                    if let Err(release_err) = self.locks.release(record.workflow_id) {
                        log::error!(
                            "could not release lock after failed reconstruction. workflow_id={:?} error={:?}",
                            record.workflow_id,
                            release_err
                        );
                    }
                }
                return Err(err);
            }
        };
        workflow.set_id(record.workflow_id);
        workflow.set_context(record.context);
        workflow.set_error_count(record.error_count);
        if workflow.exceeded_error_budget() {
            log::warn!(
                "workflow exceeded its error budget and will be finished. workflow_id={:?} error_count={:?}",
                record.workflow_id,
                record.error_count
            );
            workflow.mark_finished();
        }
        Ok(Some(workflow))
    }

    /// Persists one execution round. Context, schedule, the finished and
    /// erroring reports all come from the collaborator; `unlock` is the
    /// driver's call. Returns false when the row has gone missing.
    pub fn save(&self, workflow: &dyn Workflow, unlock: bool, now: DateTime<Utc>) -> StoreResult<bool> {
        let checkpoint = WorkflowCheckpoint {
            workflow_id: workflow.id(),
            context: workflow.context(),
            scheduled_at: workflow.scheduled_at(),
            finished: workflow.is_finished(),
            unlock,
            erroring: workflow.is_erroring(),
            saved_at: now,
        };
        let saved = self.state.store.save_workflow(checkpoint)?;
        if !saved {
            log::error!(
                "save found no workflow row. workflow_id={:?}",
                workflow.id()
            );
        }
        Ok(saved)
    }

    /// Administrative finish: cascades events and subscriptions without
    /// requiring the lock. Returns false when the workflow does not exist.
    pub fn finish(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> StoreResult<bool> {
        self.state.store.finish_workflow(workflow_id, now)
    }

    /// Due workflow ids at `now`, schedule ascending. An empty type filter
    /// matches every type.
    pub fn list_due(
        &self,
        workflow_type: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowId>> {
        self.state.store.due_workflows(workflow_type, now, limit)
    }

    /// A workflow's still-open events, oldest first.
    pub fn open_events(&self, workflow_id: WorkflowId) -> StoreResult<Vec<EventRecord>> {
        self.state.store.open_events(workflow_id)
    }
}
