use crate::{
    EventId, EventRecord, EventStatus, HostRecord, LogEntry, StoreResult, SubscriptionRecord,
    SubscriptionStatus, WorkflowContext, WorkflowId, WorkflowRecord, WorkflowStatus, WorkflowType,
    NO_SUBSCRIBERS_WORKFLOW_ID, UNIQUENESS_EVENT_TYPE, WILDCARD,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Shared handle over the store, created once per process and passed into
/// every component that needs persistence.
#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn Store>,
}

/// A workflow row about to be inserted. Identity is assigned by the store.
#[derive(Clone, Debug)]
pub struct NewWorkflowRecord {
    pub workflow_type: WorkflowType,
    pub context: WorkflowContext,
    pub scheduled_at: DateTime<Utc>,
}

/// A subscription row about to be inserted.
///
/// When passed to [`Store::insert_workflow`] the `workflow_id` is overwritten
/// with the freshly generated workflow id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewSubscriptionRecord {
    pub workflow_id: WorkflowId,
    pub event_type: String,
    pub context_key: String,
    pub context_value: String,
}

/// Everything one save writes back, assembled from the workflow's reports.
#[derive(Clone, Debug)]
pub struct WorkflowCheckpoint {
    pub workflow_id: WorkflowId,
    pub context: WorkflowContext,
    pub scheduled_at: DateTime<Utc>,
    /// Moves the row to FINISHED and cascades events and subscriptions.
    pub finished: bool,
    /// Releases the lock and reactivates the row (unless finished).
    pub unlock: bool,
    /// Suppresses the error-count decrement of a healthy unlocking save.
    pub erroring: bool,
    pub saved_at: DateTime<Utc>,
}

/// Persistence contract of the coordination core.
///
/// Every conditional statement answers through its affected-row count: a
/// `false`/empty return is the normal lost-a-race outcome, never an error.
/// Composite operations are single transactions; a failed transaction leaves
/// no partially-applied state behind.
pub trait Store: Send + Sync {
    /// Inserts a workflow row plus its subscription rows in one transaction
    /// and returns the generated id. The subscription rows' `workflow_id` is
    /// stamped with that id before insert.
    fn insert_workflow(
        &self,
        workflow: NewWorkflowRecord,
        subscriptions: Vec<NewSubscriptionRecord>,
    ) -> StoreResult<WorkflowId>;

    /// Reads a workflow constrained to `lock = token`. No row means the
    /// workflow either does not exist or is not held under that token, which
    /// is how lock contention surfaces without a separate error channel.
    fn fetch_workflow(
        &self,
        workflow_id: WorkflowId,
        token: &str,
    ) -> StoreResult<Option<WorkflowRecord>>;

    /// Reads a workflow regardless of lock ownership.
    fn fetch_workflow_any(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowRecord>>;

    /// Applies one checkpoint: context and schedule always; lock, status and
    /// error count depending on the checkpoint's unlock/finished/erroring
    /// reports. A finished checkpoint also moves the workflow's ACTIVE events
    /// to PROCESSED and its subscriptions to FINISHED, all in the same
    /// transaction. Returns false when the workflow does not exist.
    fn save_workflow(&self, checkpoint: WorkflowCheckpoint) -> StoreResult<bool>;

    /// Forces the finished cascade without requiring the lock or new context.
    /// Returns false when the workflow does not exist.
    fn finish_workflow(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Ids of ACTIVE workflows that are due at `now`: the schedule has passed,
    /// or an ACTIVE event created after the workflow's last execution start
    /// has. Ordered by schedule ascending, capped at `limit`. Concurrent
    /// callers may see overlapping sets; the lock at fetch time disambiguates.
    fn due_workflows(
        &self,
        workflow_type: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowId>>;

    /// The acquire statement: sets lock, IN_PROGRESS, started_at and bumps
    /// error_count, only where the lock column is still the empty sentinel
    /// and the row is not finished. False means another owner raced ahead.
    fn lock_workflow(
        &self,
        workflow_id: WorkflowId,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Clears the lock and reactivates the row, only where the lock still
    /// equals `expected_token`. Serves both the owner's own release and the
    /// reaper's reclaim of a dead owner's lock.
    fn release_workflow(&self, workflow_id: WorkflowId, expected_token: &str) -> StoreResult<bool>;

    /// IN_PROGRESS workflows whose lock is non-empty and whose last start is
    /// older than `cutoff`, capped at `limit`.
    fn stale_locked_workflows(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowRecord>>;

    /// One atomic insert-select: materializes an ACTIVE event row for every
    /// ACTIVE subscription of `event_type` whose (key, value) equals the
    /// tested pair or the wildcard pair, skipping workflows in `exclude`,
    /// bounded by `cap` rows. At most one row lands per workflow even when
    /// both an exact and a wildcard subscription match. Returns the
    /// newly-matched workflow ids.
    fn fan_out_event(
        &self,
        event_type: &str,
        context: &serde_json::Value,
        context_key: &str,
        context_value: &str,
        exclude: &[WorkflowId],
        cap: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkflowId>>;

    /// Records the single NO_SUBSCRIBERS sentinel row for an occurrence that
    /// matched nothing.
    fn insert_fallback_event(
        &self,
        event_type: &str,
        context: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<EventId>;

    /// A workflow's ACTIVE event rows, oldest first.
    fn open_events(&self, workflow_id: WorkflowId) -> StoreResult<Vec<EventRecord>>;

    /// Inserts a subscription row unless the identical (workflow, event_type,
    /// key, value) tuple already exists. Returns whether a row was written.
    fn insert_subscription_if_absent(
        &self,
        subscription: NewSubscriptionRecord,
    ) -> StoreResult<bool>;

    /// True iff an ACTIVE row with the reserved uniqueness event type and the
    /// given fingerprint exists.
    fn uniqueness_exists(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Moves all of a workflow's ACTIVE subscriptions to FINISHED and returns
    /// how many rows changed.
    fn retire_subscriptions(&self, workflow_id: WorkflowId) -> StoreResult<u64>;

    /// Inserts or refreshes a host heartbeat row.
    fn upsert_host(&self, hostname: &str, now: DateTime<Utc>) -> StoreResult<()>;

    /// Deletes host rows last updated before `cutoff`; returns the count.
    fn purge_hosts(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Hostnames currently carrying a heartbeat row.
    fn active_hosts(&self) -> StoreResult<Vec<String>>;

    /// Appends one execution log row. There is no read path in this core.
    fn append_log(&self, entry: LogEntry) -> StoreResult<()>;
}

/// Store implementation over plain vectors, mirroring the conditional-update
/// semantics of the SQL implementation. Fields are public so tests can
/// inspect rows directly. Methods that hold more than one guard take them
/// in field order.
pub struct InMemoryStore {
    pub workflows: Mutex<Vec<WorkflowRecord>>,
    pub events: Mutex<Vec<EventRecord>>,
    pub subscriptions: Mutex<Vec<SubscriptionRecord>>,
    pub hosts: Mutex<Vec<HostRecord>>,
    pub log: Mutex<Vec<LogEntry>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            workflows: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            hosts: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryStore {
    fn matches_pair(
        subscription: &SubscriptionRecord,
        context_key: &str,
        context_value: &str,
    ) -> bool {
        (subscription.context_key == context_key && subscription.context_value == context_value)
            || (subscription.context_key == WILDCARD && subscription.context_value == WILDCARD)
    }
}

impl Store for InMemoryStore {
    fn insert_workflow(
        &self,
        workflow: NewWorkflowRecord,
        subscriptions: Vec<NewSubscriptionRecord>,
    ) -> StoreResult<WorkflowId> {
        let mut workflows = self.workflows.lock().unwrap();
        // Rows are never deleted, so the next id is stable.
        let workflow_id = workflows.len() as WorkflowId + 1;
        workflows.push(WorkflowRecord {
            workflow_id,
            workflow_type: workflow.workflow_type,
            context: workflow.context,
            scheduled_at: workflow.scheduled_at,
            started_at: None,
            finished_at: None,
            status: WorkflowStatus::Active,
            lock: String::new(),
            error_count: 0,
        });
        let mut all_subscriptions = self.subscriptions.lock().unwrap();
        for row in subscriptions {
            let subscription_id = all_subscriptions.len() as i64 + 1;
            all_subscriptions.push(SubscriptionRecord {
                subscription_id,
                workflow_id,
                status: SubscriptionStatus::Active,
                event_type: row.event_type,
                context_key: row.context_key,
                context_value: row.context_value,
            });
        }
        Ok(workflow_id)
    }

    fn fetch_workflow(
        &self,
        workflow_id: WorkflowId,
        token: &str,
    ) -> StoreResult<Option<WorkflowRecord>> {
        let workflows = self.workflows.lock().unwrap();
        Ok(workflows
            .iter()
            .find(|w| w.workflow_id == workflow_id && w.lock == token)
            .cloned())
    }

    fn fetch_workflow_any(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowRecord>> {
        let workflows = self.workflows.lock().unwrap();
        Ok(workflows
            .iter()
            .find(|w| w.workflow_id == workflow_id)
            .cloned())
    }

    fn save_workflow(&self, checkpoint: WorkflowCheckpoint) -> StoreResult<bool> {
        let mut workflows = self.workflows.lock().unwrap();
        let workflow = match workflows
            .iter_mut()
            .find(|w| w.workflow_id == checkpoint.workflow_id)
        {
            Some(w) => w,
            None => return Ok(false),
        };
        workflow.context = checkpoint.context;
        workflow.scheduled_at = checkpoint.scheduled_at;
        if checkpoint.unlock && !checkpoint.erroring && workflow.error_count > 0 {
            workflow.error_count -= 1;
        }
        if checkpoint.finished {
            workflow.status = WorkflowStatus::Finished;
            workflow.lock = String::new();
            workflow.finished_at = Some(checkpoint.saved_at);
        } else if checkpoint.unlock {
            workflow.status = WorkflowStatus::Active;
            workflow.lock = String::new();
        }
        if checkpoint.finished {
            let mut events = self.events.lock().unwrap();
            for event in events
                .iter_mut()
                .filter(|e| e.workflow_id == checkpoint.workflow_id)
            {
                if event.status == EventStatus::Active {
                    event.status = EventStatus::Processed;
                    event.finished_at = Some(checkpoint.saved_at);
                }
            }
            let mut subscriptions = self.subscriptions.lock().unwrap();
            for subscription in subscriptions
                .iter_mut()
                .filter(|s| s.workflow_id == checkpoint.workflow_id)
            {
                subscription.status = SubscriptionStatus::Finished;
            }
        }
        Ok(true)
    }

    fn finish_workflow(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> StoreResult<bool> {
        {
            let mut workflows = self.workflows.lock().unwrap();
            let workflow = match workflows.iter_mut().find(|w| w.workflow_id == workflow_id) {
                Some(w) => w,
                None => return Ok(false),
            };
            workflow.status = WorkflowStatus::Finished;
            workflow.lock = String::new();
            workflow.finished_at = Some(now);
        }
        let mut events = self.events.lock().unwrap();
        for event in events.iter_mut().filter(|e| e.workflow_id == workflow_id) {
            if event.status == EventStatus::Active {
                event.status = EventStatus::Processed;
                event.finished_at = Some(now);
            }
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        for subscription in subscriptions
            .iter_mut()
            .filter(|s| s.workflow_id == workflow_id)
        {
            subscription.status = SubscriptionStatus::Finished;
        }
        Ok(true)
    }

    fn due_workflows(
        &self,
        workflow_type: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowId>> {
        let workflows = self.workflows.lock().unwrap();
        let events = self.events.lock().unwrap();
        let mut due: Vec<(DateTime<Utc>, WorkflowId)> = workflows
            .iter()
            .filter(|w| w.status == WorkflowStatus::Active)
            .filter(|w| workflow_type.is_empty() || w.workflow_type == workflow_type)
            .filter(|w| {
                if w.scheduled_at <= now {
                    return true;
                }
                // An event only wakes the workflow if it arrived after the
                // last execution started; rounds already had a chance to see
                // anything older.
                events.iter().any(|e| {
                    e.workflow_id == w.workflow_id
                        && e.status == EventStatus::Active
                        && e.created_at <= now
                        && w.started_at.map_or(true, |started| e.created_at > started)
                })
            })
            .map(|w| (w.scheduled_at, w.workflow_id))
            .collect();
        due.sort_by_key(|(scheduled_at, _)| *scheduled_at);
        due.truncate(limit as usize);
        Ok(due.into_iter().map(|(_, workflow_id)| workflow_id).collect())
    }

    fn lock_workflow(
        &self,
        workflow_id: WorkflowId,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut workflows = self.workflows.lock().unwrap();
        match workflows.iter_mut().find(|w| {
            w.workflow_id == workflow_id
                && w.lock.is_empty()
                && w.status != WorkflowStatus::Finished
        }) {
            Some(workflow) => {
                workflow.lock = token.to_string();
                workflow.status = WorkflowStatus::InProgress;
                workflow.started_at = Some(now);
                workflow.error_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release_workflow(&self, workflow_id: WorkflowId, expected_token: &str) -> StoreResult<bool> {
        let mut workflows = self.workflows.lock().unwrap();
        match workflows
            .iter_mut()
            .find(|w| w.workflow_id == workflow_id && w.lock == expected_token && !w.lock.is_empty())
        {
            Some(workflow) => {
                workflow.lock = String::new();
                workflow.status = WorkflowStatus::Active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn stale_locked_workflows(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowRecord>> {
        let workflows = self.workflows.lock().unwrap();
        Ok(workflows
            .iter()
            .filter(|w| {
                w.status == WorkflowStatus::InProgress
                    && !w.lock.is_empty()
                    && w.started_at.map_or(false, |started| started < cutoff)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn fan_out_event(
        &self,
        event_type: &str,
        context: &serde_json::Value,
        context_key: &str,
        context_value: &str,
        exclude: &[WorkflowId],
        cap: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkflowId>> {
        // Guards nest in field order: events before subscriptions.
        let mut events = self.events.lock().unwrap();
        let subscriptions = self.subscriptions.lock().unwrap();
        let mut matched: Vec<WorkflowId> = Vec::new();
        for subscription in subscriptions.iter().filter(|s| {
            s.status == SubscriptionStatus::Active
                && s.event_type == event_type
                && Self::matches_pair(s, context_key, context_value)
        }) {
            if matched.len() as i64 >= cap {
                break;
            }
            if exclude.contains(&subscription.workflow_id)
                || matched.contains(&subscription.workflow_id)
            {
                continue;
            }
            matched.push(subscription.workflow_id);
        }
        for workflow_id in &matched {
            let event_id = events.len() as EventId + 1;
            events.push(EventRecord {
                event_id,
                event_type: event_type.to_string(),
                context: context.clone(),
                status: EventStatus::Active,
                workflow_id: *workflow_id,
                created_at: now,
                finished_at: None,
            });
        }
        Ok(matched)
    }

    fn insert_fallback_event(
        &self,
        event_type: &str,
        context: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<EventId> {
        let mut events = self.events.lock().unwrap();
        let event_id = events.len() as EventId + 1;
        events.push(EventRecord {
            event_id,
            event_type: event_type.to_string(),
            context: context.clone(),
            status: EventStatus::NoSubscribers,
            workflow_id: NO_SUBSCRIBERS_WORKFLOW_ID,
            created_at: now,
            finished_at: None,
        });
        Ok(event_id)
    }

    fn open_events(&self, workflow_id: WorkflowId) -> StoreResult<Vec<EventRecord>> {
        let events = self.events.lock().unwrap();
        let mut open: Vec<EventRecord> = events
            .iter()
            .filter(|e| e.workflow_id == workflow_id && e.status == EventStatus::Active)
            .cloned()
            .collect();
        open.sort_by_key(|e| e.created_at);
        Ok(open)
    }

    fn insert_subscription_if_absent(
        &self,
        subscription: NewSubscriptionRecord,
    ) -> StoreResult<bool> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let exists = subscriptions.iter().any(|s| {
            s.workflow_id == subscription.workflow_id
                && s.event_type == subscription.event_type
                && s.context_key == subscription.context_key
                && s.context_value == subscription.context_value
        });
        if exists {
            return Ok(false);
        }
        let subscription_id = subscriptions.len() as i64 + 1;
        subscriptions.push(SubscriptionRecord {
            subscription_id,
            workflow_id: subscription.workflow_id,
            status: SubscriptionStatus::Active,
            event_type: subscription.event_type,
            context_key: subscription.context_key,
            context_value: subscription.context_value,
        });
        Ok(true)
    }

    fn uniqueness_exists(&self, key: &str, value: &str) -> StoreResult<bool> {
        let subscriptions = self.subscriptions.lock().unwrap();
        Ok(subscriptions.iter().any(|s| {
            s.status == SubscriptionStatus::Active
                && s.event_type == UNIQUENESS_EVENT_TYPE
                && s.context_key == key
                && s.context_value == value
        }))
    }

    fn retire_subscriptions(&self, workflow_id: WorkflowId) -> StoreResult<u64> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let mut retired = 0;
        for subscription in subscriptions
            .iter_mut()
            .filter(|s| s.workflow_id == workflow_id && s.status == SubscriptionStatus::Active)
        {
            subscription.status = SubscriptionStatus::Finished;
            retired += 1;
        }
        Ok(retired)
    }

    fn upsert_host(&self, hostname: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut hosts = self.hosts.lock().unwrap();
        match hosts.iter_mut().find(|h| h.hostname == hostname) {
            Some(host) => host.updated_at = now,
            None => hosts.push(HostRecord {
                hostname: hostname.to_string(),
                updated_at: now,
            }),
        }
        Ok(())
    }

    fn purge_hosts(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut hosts = self.hosts.lock().unwrap();
        let before = hosts.len();
        hosts.retain(|h| h.updated_at >= cutoff);
        Ok((before - hosts.len()) as u64)
    }

    fn active_hosts(&self) -> StoreResult<Vec<String>> {
        let hosts = self.hosts.lock().unwrap();
        Ok(hosts.iter().map(|h| h.hostname.clone()).collect())
    }

    fn append_log(&self, entry: LogEntry) -> StoreResult<()> {
        let mut log = self.log.lock().unwrap();
        log.push(entry);
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;

    pub fn create_test_state() -> State {
        State {
            store: Arc::new(InMemoryStore::default()),
        }
    }

    pub fn insert_plain_workflow(
        store: &dyn Store,
        workflow_type: &str,
        scheduled_at: DateTime<Utc>,
    ) -> WorkflowId {
        store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: workflow_type.to_string(),
                    context: json!({}),
                    scheduled_at,
                },
                vec![],
            )
            .unwrap()
    }

    fn subscription_row(event_type: &str, key: &str, value: &str) -> NewSubscriptionRecord {
        NewSubscriptionRecord {
            workflow_id: 0,
            event_type: event_type.to_string(),
            context_key: key.to_string(),
            context_value: value.to_string(),
        }
    }

    #[test]
    fn test_lock_workflow_single_winner() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = insert_plain_workflow(&store, "test", now);
        // First acquire wins, second loses without error.
        assert!(store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
        assert!(!store.lock_workflow(workflow_id, "hostb:22", now).unwrap());
        // The token-constrained read only answers for the winner.
        let winner = store.fetch_workflow(workflow_id, "hosta:11").unwrap();
        assert!(winner.is_some());
        let winner = winner.unwrap();
        assert_eq!(WorkflowStatus::InProgress, winner.status);
        assert_eq!(1, winner.error_count);
        assert_eq!(Some(now), winner.started_at);
        assert!(store.fetch_workflow(workflow_id, "hostb:22").unwrap().is_none());
    }

    #[test]
    fn test_lock_workflow_skips_finished() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = insert_plain_workflow(&store, "test", now);
        assert!(store.finish_workflow(workflow_id, now).unwrap());
        assert!(!store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
    }

    #[test]
    fn test_release_workflow_requires_matching_token() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = insert_plain_workflow(&store, "test", now);
        assert!(store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
        assert!(!store.release_workflow(workflow_id, "hostb:22").unwrap());
        assert!(store.release_workflow(workflow_id, "hosta:11").unwrap());
        let workflow = store.fetch_workflow_any(workflow_id).unwrap().unwrap();
        assert_eq!(WorkflowStatus::Active, workflow.status);
        assert_eq!("", workflow.lock);
        // Releasing an already unlocked workflow changes nothing.
        assert!(!store.release_workflow(workflow_id, "").unwrap());
    }

    #[test]
    fn test_save_workflow_finished_cascade() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: "test".to_string(),
                    context: json!({"step": 0}),
                    scheduled_at: now,
                },
                vec![subscription_row("order", "region", "EU")],
            )
            .unwrap();
        store
            .fan_out_event("order", &json!({"region": "EU"}), "region", "EU", &[], 1000, now)
            .unwrap();
        assert!(store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
        let saved = store
            .save_workflow(WorkflowCheckpoint {
                workflow_id,
                context: json!({"step": 1}),
                scheduled_at: now,
                finished: true,
                unlock: true,
                erroring: false,
                saved_at: now,
            })
            .unwrap();
        assert!(saved);
        let workflow = store.fetch_workflow_any(workflow_id).unwrap().unwrap();
        assert_eq!(WorkflowStatus::Finished, workflow.status);
        assert_eq!("", workflow.lock);
        assert_eq!(Some(now), workflow.finished_at);
        assert_eq!(json!({"step": 1}), workflow.context);
        let events = store.events.lock().unwrap();
        assert!(events.iter().all(|e| e.status == EventStatus::Processed));
        let subscriptions = store.subscriptions.lock().unwrap();
        assert!(subscriptions
            .iter()
            .all(|s| s.status == SubscriptionStatus::Finished));
    }

    #[test]
    fn test_save_workflow_error_count_transitions() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = insert_plain_workflow(&store, "test", now);
        let checkpoint = |erroring: bool| WorkflowCheckpoint {
            workflow_id,
            context: json!({}),
            scheduled_at: now,
            finished: false,
            unlock: true,
            erroring,
            saved_at: now,
        };
        // Healthy round: the acquire's +1 is paid back on unlock.
        assert!(store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
        assert!(store.save_workflow(checkpoint(false)).unwrap());
        let workflow = store.fetch_workflow_any(workflow_id).unwrap().unwrap();
        assert_eq!(0, workflow.error_count);
        assert_eq!(WorkflowStatus::Active, workflow.status);
        // Erroring round: the +1 sticks.
        assert!(store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
        assert!(store.save_workflow(checkpoint(true)).unwrap());
        let workflow = store.fetch_workflow_any(workflow_id).unwrap().unwrap();
        assert_eq!(1, workflow.error_count);
        // The counter never goes below zero.
        assert!(store.save_workflow(checkpoint(false)).unwrap());
        assert!(store.save_workflow(checkpoint(false)).unwrap());
        let workflow = store.fetch_workflow_any(workflow_id).unwrap().unwrap();
        assert_eq!(0, workflow.error_count);
    }

    #[test]
    fn test_save_workflow_keeps_lock_when_not_unlocking() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = insert_plain_workflow(&store, "test", now);
        assert!(store.lock_workflow(workflow_id, "hosta:11", now).unwrap());
        assert!(store
            .save_workflow(WorkflowCheckpoint {
                workflow_id,
                context: json!({"step": 1}),
                scheduled_at: now,
                finished: false,
                unlock: false,
                erroring: false,
                saved_at: now,
            })
            .unwrap());
        let workflow = store.fetch_workflow_any(workflow_id).unwrap().unwrap();
        assert_eq!("hosta:11", workflow.lock);
        assert_eq!(WorkflowStatus::InProgress, workflow.status);
        assert_eq!(1, workflow.error_count);
        assert_eq!(json!({"step": 1}), workflow.context);
    }

    #[test]
    fn test_save_workflow_missing_returns_false() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        assert!(!store
            .save_workflow(WorkflowCheckpoint {
                workflow_id: 99,
                context: json!({}),
                scheduled_at: now,
                finished: false,
                unlock: true,
                erroring: false,
                saved_at: now,
            })
            .unwrap());
        assert!(!store.finish_workflow(99, now).unwrap());
    }

    #[test]
    fn test_due_workflows_schedule_window() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let due_id = insert_plain_workflow(&store, "test", now - Duration::seconds(5));
        let not_due = insert_plain_workflow(&store, "test", now + Duration::seconds(60));
        let due = store.due_workflows("", now, 100).unwrap();
        assert!(due.contains(&due_id));
        assert!(!due.contains(&not_due));
        // Finished workflows never come back as due.
        store.finish_workflow(due_id, now).unwrap();
        assert!(store.due_workflows("", now, 100).unwrap().is_empty());
    }

    #[test]
    fn test_due_workflows_event_window() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: "test".to_string(),
                    context: json!({}),
                    // Scheduled far in the future; only events can wake it.
                    scheduled_at: now + Duration::hours(1),
                },
                vec![subscription_row("order", "region", "EU")],
            )
            .unwrap();
        assert!(store.due_workflows("", now, 100).unwrap().is_empty());
        store
            .fan_out_event("order", &json!({}), "region", "EU", &[], 1000, now)
            .unwrap();
        assert_eq!(vec![workflow_id], store.due_workflows("", now, 100).unwrap());
        // Once an execution starts after the event, the same event stops
        // waking the workflow.
        let later = now + Duration::seconds(10);
        assert!(store.lock_workflow(workflow_id, "hosta:11", later).unwrap());
        assert!(store
            .save_workflow(WorkflowCheckpoint {
                workflow_id,
                context: json!({}),
                scheduled_at: now + Duration::hours(1),
                finished: false,
                unlock: true,
                erroring: false,
                saved_at: later,
            })
            .unwrap());
        assert!(store
            .due_workflows("", now + Duration::seconds(20), 100)
            .unwrap()
            .is_empty());
        // An event arriving after the last start wakes it again.
        store
            .fan_out_event(
                "order",
                &json!({}),
                "region",
                "EU",
                &[],
                1000,
                now + Duration::seconds(30),
            )
            .unwrap();
        assert_eq!(
            vec![workflow_id],
            store
                .due_workflows("", now + Duration::seconds(40), 100)
                .unwrap()
        );
    }

    #[test]
    fn test_due_workflows_type_filter_order_and_limit() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let later = insert_plain_workflow(&store, "alpha", now - Duration::seconds(1));
        let earlier = insert_plain_workflow(&store, "alpha", now - Duration::seconds(30));
        let other_type = insert_plain_workflow(&store, "beta", now - Duration::seconds(60));
        let due = store.due_workflows("alpha", now, 100).unwrap();
        assert_eq!(vec![earlier, later], due);
        assert!(!due.contains(&other_type));
        assert_eq!(1, store.due_workflows("", now, 1).unwrap().len());
    }

    #[test]
    fn test_fan_out_event_dedupes_and_caps() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        // One workflow with both an exact and a wildcard subscription, one
        // wildcard-only, one on a different value.
        let both = store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: "test".to_string(),
                    context: json!({}),
                    scheduled_at: now,
                },
                vec![
                    subscription_row("order", "region", "EU"),
                    subscription_row("order", WILDCARD, WILDCARD),
                ],
            )
            .unwrap();
        let wildcard_only = store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: "test".to_string(),
                    context: json!({}),
                    scheduled_at: now,
                },
                vec![subscription_row("order", WILDCARD, WILDCARD)],
            )
            .unwrap();
        let other_value = store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: "test".to_string(),
                    context: json!({}),
                    scheduled_at: now,
                },
                vec![subscription_row("order", "region", "US")],
            )
            .unwrap();
        let matched = store
            .fan_out_event("order", &json!({}), "region", "EU", &[], 1000, now)
            .unwrap();
        assert_eq!(vec![both, wildcard_only], matched);
        assert!(!matched.contains(&other_value));
        let events = store.events.lock().unwrap();
        assert_eq!(2, events.len());
        drop(events);
        // The exclusion set keeps a second pair of the same occurrence from
        // matching the same workflow twice.
        let matched = store
            .fan_out_event("order", &json!({}), "region", "US", &matched, 1000, now)
            .unwrap();
        assert_eq!(vec![other_value], matched);
        // The cap bounds each statement.
        let matched = store
            .fan_out_event("order", &json!({}), "region", "EU", &[], 1, now)
            .unwrap();
        assert_eq!(1, matched.len());
    }

    #[test]
    fn test_concurrent_finish_and_fan_out() {
        let store = Arc::new(InMemoryStore::default());
        let now = Utc::now();
        let ids: Vec<WorkflowId> = (0..8)
            .map(|_| {
                store
                    .insert_workflow(
                        NewWorkflowRecord {
                            workflow_type: "test".to_string(),
                            context: json!({}),
                            scheduled_at: now,
                        },
                        vec![subscription_row("order", WILDCARD, WILDCARD)],
                    )
                    .unwrap()
            })
            .collect();
        // A finishing saver and a router hammer the same store; the watchdog
        // fails the test instead of hanging it if either side stops making
        // progress.
        let (done_tx, done_rx) = mpsc::channel();
        let saver = {
            let store = Arc::clone(&store);
            let ids = ids.clone();
            let done = done_tx.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    for &workflow_id in &ids {
                        store
                            .save_workflow(WorkflowCheckpoint {
                                workflow_id,
                                context: json!({}),
                                scheduled_at: now,
                                finished: true,
                                unlock: true,
                                erroring: false,
                                saved_at: now,
                            })
                            .unwrap();
                    }
                }
                done.send(()).unwrap();
            })
        };
        let router = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..1600 {
                    store
                        .fan_out_event("order", &json!({}), "region", "EU", &[], 1000, now)
                        .unwrap();
                }
                done_tx.send(()).unwrap();
            })
        };
        for _ in 0..2 {
            done_rx
                .recv_timeout(std::time::Duration::from_secs(30))
                .expect("store call did not come back");
        }
        saver.join().unwrap();
        router.join().unwrap();
        let workflows = store.workflows.lock().unwrap();
        assert!(workflows.iter().all(|w| w.status == WorkflowStatus::Finished));
        let subscriptions = store.subscriptions.lock().unwrap();
        assert!(subscriptions
            .iter()
            .all(|s| s.status == SubscriptionStatus::Finished));
    }

    #[test]
    fn test_subscription_idempotency_and_uniqueness() {
        let store = InMemoryStore::default();
        let row = NewSubscriptionRecord {
            workflow_id: 7,
            event_type: "order".to_string(),
            context_key: "region".to_string(),
            context_value: "EU".to_string(),
        };
        assert!(store.insert_subscription_if_absent(row.clone()).unwrap());
        assert!(!store.insert_subscription_if_absent(row).unwrap());
        assert_eq!(1, store.subscriptions.lock().unwrap().len());
        let fingerprint = NewSubscriptionRecord {
            workflow_id: 7,
            event_type: UNIQUENESS_EVENT_TYPE.to_string(),
            context_key: "customer".to_string(),
            context_value: "42".to_string(),
        };
        assert!(store.insert_subscription_if_absent(fingerprint).unwrap());
        assert!(store.uniqueness_exists("customer", "42").unwrap());
        assert!(!store.uniqueness_exists("customer", "43").unwrap());
        // Retiring the workflow's subscriptions retires the fingerprint too.
        assert_eq!(2, store.retire_subscriptions(7).unwrap());
        assert!(!store.uniqueness_exists("customer", "42").unwrap());
    }

    #[test]
    fn test_stale_locked_workflows_cutoff_and_limit() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let stale_a = insert_plain_workflow(&store, "test", now);
        let stale_b = insert_plain_workflow(&store, "test", now);
        let fresh = insert_plain_workflow(&store, "test", now);
        let long_ago = now - Duration::minutes(60);
        assert!(store.lock_workflow(stale_a, "hosta:11", long_ago).unwrap());
        assert!(store.lock_workflow(stale_b, "hostb:22", long_ago).unwrap());
        assert!(store.lock_workflow(fresh, "hosta:11", now).unwrap());
        let cutoff = now - Duration::minutes(30);
        let stale = store.stale_locked_workflows(cutoff, 100).unwrap();
        let stale_ids: Vec<WorkflowId> = stale.iter().map(|w| w.workflow_id).collect();
        assert_eq!(vec![stale_a, stale_b], stale_ids);
        assert_eq!(1, store.stale_locked_workflows(cutoff, 1).unwrap().len());
    }

    #[test]
    fn test_hosts_heartbeat_and_purge() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        store.upsert_host("alpha", now - Duration::seconds(600)).unwrap();
        store.upsert_host("beta", now).unwrap();
        // Re-upserting refreshes instead of duplicating.
        store.upsert_host("beta", now).unwrap();
        assert_eq!(2, store.hosts.lock().unwrap().len());
        let purged = store.purge_hosts(now - Duration::seconds(300)).unwrap();
        assert_eq!(1, purged);
        assert_eq!(vec!["beta".to_string()], store.active_hosts().unwrap());
        // A refreshed heartbeat survives the next purge.
        store.upsert_host("alpha", now).unwrap();
        assert_eq!(0, store.purge_hosts(now - Duration::seconds(300)).unwrap());
    }

    #[test]
    fn test_open_events_only_active_in_order() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        let workflow_id = store
            .insert_workflow(
                NewWorkflowRecord {
                    workflow_type: "test".to_string(),
                    context: json!({}),
                    scheduled_at: now,
                },
                vec![subscription_row("order", WILDCARD, WILDCARD)],
            )
            .unwrap();
        store
            .fan_out_event("order", &json!({"n": 2}), WILDCARD, WILDCARD, &[], 1000, now)
            .unwrap();
        store
            .fan_out_event(
                "order",
                &json!({"n": 1}),
                WILDCARD,
                WILDCARD,
                &[],
                1000,
                now - Duration::seconds(10),
            )
            .unwrap();
        let open = store.open_events(workflow_id).unwrap();
        assert_eq!(2, open.len());
        assert_eq!(json!({"n": 1}), open[0].context);
        assert_eq!(json!({"n": 2}), open[1].context);
        store.finish_workflow(workflow_id, now).unwrap();
        assert!(store.open_events(workflow_id).unwrap().is_empty());
    }
}
