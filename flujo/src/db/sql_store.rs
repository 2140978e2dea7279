//! Postgres-backed [`Store`]. Mutual exclusion rides on single conditional
//! UPDATE statements whose rows-affected count is the only success signal,
//! so no advisory locks or SELECT FOR UPDATE are needed anywhere.

use crate::db::config::DbConfig;
use crate::db::models::{
    EventRow, NewEventRow, NewHostRow, NewLogRow, NewSubscriptionRow, NewWorkflowRow, WorkflowRow,
};
use crate::db::schema::{events, execution_log, hosts, subscriptions, workflows};
use crate::state::{NewSubscriptionRecord, NewWorkflowRecord, Store, WorkflowCheckpoint};
use crate::{
    EventId, EventRecord, EventStatus, LogEntry, StoreError, StoreResult, SubscriptionStatus,
    WorkflowId, WorkflowRecord, WorkflowStatus, NO_SUBSCRIBERS_WORKFLOW_ID, UNIQUENESS_EVENT_TYPE,
};
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::Error as DieselError;
use diesel::sql_types::{Array, BigInt, Jsonb, Text, Timestamptz};
use std::sync::Arc;

pub type PgPool = diesel::r2d2::Pool<ConnectionManager<PgConnection>>;
pub type DbPool = Arc<PgPool>;

/// Tables probed by [`SqlStore::verify_schema`].
const TABLES: [&str; 5] = [
    "workflows",
    "events",
    "subscriptions",
    "hosts",
    "execution_log",
];

/// The set-based fan-out statement. One INSERT..SELECT per routing pair;
/// DISTINCT collapses a workflow whose exact and wildcard subscriptions both
/// match down to a single event row, and the exclusion array keeps workflows
/// already matched by an earlier pair of the same occurrence out.
const FAN_OUT_SQL: &str = r#"
INSERT INTO events ("type", context, status, workflow_id, created_at)
SELECT DISTINCT $1, $2, 'ACTIVE', s.workflow_id, $3
  FROM subscriptions s
 WHERE s.status = 'ACTIVE'
   AND s.event_type = $1
   AND ((s.context_key = $4 AND s.context_value = $5)
        OR (s.context_key = '' AND s.context_value = ''))
   AND NOT (s.workflow_id = ANY($6))
 LIMIT $7
RETURNING workflow_id
"#;

/// Due means: ACTIVE, and either the schedule has passed or an ACTIVE event
/// arrived after the last execution started. The correlated EXISTS keeps this
/// a single round trip.
const DUE_SQL: &str = r#"
SELECT w.workflow_id
  FROM workflows w
 WHERE w.status = 'ACTIVE'
   AND ($1 = '' OR w."type" = $1)
   AND (w.scheduled_at <= $2
        OR EXISTS (
            SELECT 1 FROM events e
             WHERE e.workflow_id = w.workflow_id
               AND e.status = 'ACTIVE'
               AND e.created_at <= $2
               AND (w.started_at IS NULL OR e.created_at > w.started_at)))
 ORDER BY w.scheduled_at ASC
 LIMIT $3
"#;

const INSERT_SUBSCRIPTION_SQL: &str = r#"
INSERT INTO subscriptions (workflow_id, status, event_type, context_key, context_value)
SELECT $1, 'ACTIVE', $2, $3, $4
 WHERE NOT EXISTS (
       SELECT 1 FROM subscriptions
        WHERE workflow_id = $1
          AND event_type = $2
          AND context_key = $3
          AND context_value = $4)
"#;

const DECREMENT_ERROR_COUNT_SQL: &str =
    "UPDATE workflows SET error_count = error_count - 1 WHERE workflow_id = $1 AND error_count > 0";

#[derive(QueryableByName)]
struct WorkflowIdRow {
    #[diesel(sql_type = BigInt)]
    workflow_id: i64,
}

pub struct SqlStore {
    db_pool: DbPool,
}

impl SqlStore {
    pub fn new(config: &DbConfig) -> StoreResult<Self> {
        let manager = ConnectionManager::<PgConnection>::new(&config.url);
        let pool = PgPool::builder()
            .min_idle(Some(config.min_connections))
            .max_size(config.max_connections)
            .build(manager)?;
        Ok(Self::new_with_pool(Arc::new(pool)))
    }

    pub fn new_with_pool(db_pool: DbPool) -> Self {
        Self { db_pool }
    }

    fn conn(&self) -> StoreResult<PooledConnection<ConnectionManager<PgConnection>>> {
        Ok(self.db_pool.get()?)
    }

    /// Startup probe: one SELECT against each table, so a database missing
    /// its migrations fails the process before any polling thread starts.
    pub fn verify_schema(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        for table in TABLES {
            let probe = format!("SELECT 1 FROM {} LIMIT 1", table);
            if let Err(err) = diesel::sql_query(probe).execute(&mut conn) {
                return Err(match err {
                    DieselError::DatabaseError(_, info)
                        if info.message().contains("does not exist") =>
                    {
                        StoreError::SchemaMissing(table.to_string())
                    }
                    other => other.into(),
                });
            }
        }
        Ok(())
    }
}

/// Cascade applied when a workflow reaches FINISHED, inside the caller's
/// transaction: open events become PROCESSED and every subscription retires.
fn finish_cascade(
    conn: &mut PgConnection,
    workflow_id: WorkflowId,
    finished_at: DateTime<Utc>,
) -> Result<(), DieselError> {
    diesel::update(
        events::table
            .filter(events::workflow_id.eq(workflow_id))
            .filter(events::status.eq(EventStatus::Active.as_str())),
    )
    .set((
        events::status.eq(EventStatus::Processed.as_str()),
        events::finished_at.eq(finished_at),
    ))
    .execute(conn)?;
    diesel::update(subscriptions::table.filter(subscriptions::workflow_id.eq(workflow_id)))
        .set(subscriptions::status.eq(SubscriptionStatus::Finished.as_str()))
        .execute(conn)?;
    Ok(())
}

impl Store for SqlStore {
    fn insert_workflow(
        &self,
        workflow: NewWorkflowRecord,
        subscription_rows: Vec<NewSubscriptionRecord>,
    ) -> StoreResult<WorkflowId> {
        let mut conn = self.conn()?;
        let workflow_id = conn.build_transaction().read_write().run(|tx_conn| {
            let workflow_id: WorkflowId = diesel::insert_into(workflows::table)
                .values(NewWorkflowRow {
                    workflow_type: &workflow.workflow_type,
                    context: &workflow.context,
                    scheduled_at: workflow.scheduled_at,
                    status: WorkflowStatus::Active.as_str(),
                    lock: "",
                    error_count: 0,
                })
                .returning(workflows::workflow_id)
                .get_result(tx_conn)?;
            let rows: Vec<NewSubscriptionRow> = subscription_rows
                .iter()
                .map(|row| NewSubscriptionRow {
                    workflow_id,
                    status: SubscriptionStatus::Active.as_str(),
                    event_type: &row.event_type,
                    context_key: &row.context_key,
                    context_value: &row.context_value,
                })
                .collect();
            if !rows.is_empty() {
                diesel::insert_into(subscriptions::table)
                    .values(&rows)
                    .execute(tx_conn)?;
            }
            Ok::<WorkflowId, DieselError>(workflow_id)
        })?;
        Ok(workflow_id)
    }

    fn fetch_workflow(
        &self,
        workflow_id: WorkflowId,
        token: &str,
    ) -> StoreResult<Option<WorkflowRecord>> {
        let mut conn = self.conn()?;
        let row = workflows::table
            .filter(workflows::workflow_id.eq(workflow_id))
            .filter(workflows::lock.eq(token))
            .first::<WorkflowRow>(&mut conn)
            .optional()?;
        row.map(WorkflowRecord::try_from).transpose()
    }

    fn fetch_workflow_any(&self, workflow_id: WorkflowId) -> StoreResult<Option<WorkflowRecord>> {
        let mut conn = self.conn()?;
        let row = workflows::table
            .filter(workflows::workflow_id.eq(workflow_id))
            .first::<WorkflowRow>(&mut conn)
            .optional()?;
        row.map(WorkflowRecord::try_from).transpose()
    }

    fn save_workflow(&self, checkpoint: WorkflowCheckpoint) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let saved = conn.build_transaction().read_write().run(|tx_conn| {
            let target =
                workflows::table.filter(workflows::workflow_id.eq(checkpoint.workflow_id));
            let updated = if checkpoint.finished {
                diesel::update(target)
                    .set((
                        workflows::context.eq(&checkpoint.context),
                        workflows::scheduled_at.eq(checkpoint.scheduled_at),
                        workflows::status.eq(WorkflowStatus::Finished.as_str()),
                        workflows::lock.eq(""),
                        workflows::finished_at.eq(checkpoint.saved_at),
                    ))
                    .execute(tx_conn)?
            } else if checkpoint.unlock {
                diesel::update(target)
                    .set((
                        workflows::context.eq(&checkpoint.context),
                        workflows::scheduled_at.eq(checkpoint.scheduled_at),
                        workflows::status.eq(WorkflowStatus::Active.as_str()),
                        workflows::lock.eq(""),
                    ))
                    .execute(tx_conn)?
            } else {
                diesel::update(target)
                    .set((
                        workflows::context.eq(&checkpoint.context),
                        workflows::scheduled_at.eq(checkpoint.scheduled_at),
                    ))
                    .execute(tx_conn)?
            };
            if updated == 0 {
                return Ok(false);
            }
            if checkpoint.unlock && !checkpoint.erroring {
                // A healthy unlocking save undoes the bump the acquire made,
                // clamped at zero.
                diesel::sql_query(DECREMENT_ERROR_COUNT_SQL)
                    .bind::<BigInt, _>(checkpoint.workflow_id)
                    .execute(tx_conn)?;
            }
            if checkpoint.finished {
                finish_cascade(tx_conn, checkpoint.workflow_id, checkpoint.saved_at)?;
            }
            Ok::<bool, DieselError>(true)
        })?;
        Ok(saved)
    }

    fn finish_workflow(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let finished = conn.build_transaction().read_write().run(|tx_conn| {
            let updated =
                diesel::update(workflows::table.filter(workflows::workflow_id.eq(workflow_id)))
                    .set((
                        workflows::status.eq(WorkflowStatus::Finished.as_str()),
                        workflows::lock.eq(""),
                        workflows::finished_at.eq(now),
                    ))
                    .execute(tx_conn)?;
            if updated == 0 {
                return Ok(false);
            }
            finish_cascade(tx_conn, workflow_id, now)?;
            Ok::<bool, DieselError>(true)
        })?;
        Ok(finished)
    }

    fn due_workflows(
        &self,
        workflow_type: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowId>> {
        let mut conn = self.conn()?;
        let rows: Vec<WorkflowIdRow> = diesel::sql_query(DUE_SQL)
            .bind::<Text, _>(workflow_type)
            .bind::<Timestamptz, _>(now)
            .bind::<BigInt, _>(limit)
            .load(&mut conn)?;
        Ok(rows.into_iter().map(|row| row.workflow_id).collect())
    }

    fn lock_workflow(
        &self,
        workflow_id: WorkflowId,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            workflows::table
                .filter(workflows::workflow_id.eq(workflow_id))
                .filter(workflows::lock.eq(""))
                .filter(workflows::status.ne(WorkflowStatus::Finished.as_str())),
        )
        .set((
            workflows::lock.eq(token),
            workflows::status.eq(WorkflowStatus::InProgress.as_str()),
            workflows::started_at.eq(now),
            workflows::error_count.eq(workflows::error_count + 1),
        ))
        .execute(&mut conn)?;
        Ok(updated > 0)
    }

    fn release_workflow(&self, workflow_id: WorkflowId, expected_token: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        // The lock <> '' guard keeps an empty expected token from ever
        // matching an already-released row.
        let updated = diesel::update(
            workflows::table
                .filter(workflows::workflow_id.eq(workflow_id))
                .filter(workflows::lock.eq(expected_token))
                .filter(workflows::lock.ne("")),
        )
        .set((
            workflows::lock.eq(""),
            workflows::status.eq(WorkflowStatus::Active.as_str()),
        ))
        .execute(&mut conn)?;
        Ok(updated > 0)
    }

    fn stale_locked_workflows(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowRecord>> {
        let mut conn = self.conn()?;
        let rows = workflows::table
            .filter(workflows::status.eq(WorkflowStatus::InProgress.as_str()))
            .filter(workflows::lock.ne(""))
            .filter(workflows::started_at.lt(cutoff))
            .order(workflows::started_at.asc())
            .limit(limit)
            .load::<WorkflowRow>(&mut conn)?;
        rows.into_iter().map(WorkflowRecord::try_from).collect()
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
        let mut conn = self.conn()?;
        let rows: Vec<WorkflowIdRow> = diesel::sql_query(FAN_OUT_SQL)
            .bind::<Text, _>(event_type)
            .bind::<Jsonb, _>(context.clone())
            .bind::<Timestamptz, _>(now)
            .bind::<Text, _>(context_key)
            .bind::<Text, _>(context_value)
            .bind::<Array<BigInt>, _>(exclude.to_vec())
            .bind::<BigInt, _>(cap)
            .load(&mut conn)?;
        Ok(rows.into_iter().map(|row| row.workflow_id).collect())
    }

    fn insert_fallback_event(
        &self,
        event_type: &str,
        context: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<EventId> {
        let mut conn = self.conn()?;
        let event_id = diesel::insert_into(events::table)
            .values(NewEventRow {
                event_type,
                context,
                status: EventStatus::NoSubscribers.as_str(),
                workflow_id: NO_SUBSCRIBERS_WORKFLOW_ID,
                created_at: now,
            })
            .returning(events::event_id)
            .get_result::<EventId>(&mut conn)?;
        Ok(event_id)
    }

    fn open_events(&self, workflow_id: WorkflowId) -> StoreResult<Vec<EventRecord>> {
        let mut conn = self.conn()?;
        let rows = events::table
            .filter(events::workflow_id.eq(workflow_id))
            .filter(events::status.eq(EventStatus::Active.as_str()))
            .order(events::created_at.asc())
            .load::<EventRow>(&mut conn)?;
        rows.into_iter().map(EventRecord::try_from).collect()
    }

    fn insert_subscription_if_absent(
        &self,
        subscription: NewSubscriptionRecord,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let inserted = diesel::sql_query(INSERT_SUBSCRIPTION_SQL)
            .bind::<BigInt, _>(subscription.workflow_id)
            .bind::<Text, _>(subscription.event_type.as_str())
            .bind::<Text, _>(subscription.context_key.as_str())
            .bind::<Text, _>(subscription.context_value.as_str())
            .execute(&mut conn)?;
        Ok(inserted > 0)
    }

    fn uniqueness_exists(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let count: i64 = subscriptions::table
            .filter(subscriptions::status.eq(SubscriptionStatus::Active.as_str()))
            .filter(subscriptions::event_type.eq(UNIQUENESS_EVENT_TYPE))
            .filter(subscriptions::context_key.eq(key))
            .filter(subscriptions::context_value.eq(value))
            .count()
            .get_result(&mut conn)?;
        Ok(count > 0)
    }

    fn retire_subscriptions(&self, workflow_id: WorkflowId) -> StoreResult<u64> {
        let mut conn = self.conn()?;
        let updated = diesel::update(
            subscriptions::table
                .filter(subscriptions::workflow_id.eq(workflow_id))
                .filter(subscriptions::status.eq(SubscriptionStatus::Active.as_str())),
        )
        .set(subscriptions::status.eq(SubscriptionStatus::Finished.as_str()))
        .execute(&mut conn)?;
        Ok(updated as u64)
    }

    fn upsert_host(&self, hostname: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(hosts::table)
            .values(NewHostRow {
                hostname,
                updated_at: now,
            })
            .on_conflict(hosts::hostname)
            .do_update()
            .set(hosts::updated_at.eq(now))
            .execute(&mut conn)?;
        Ok(())
    }

    fn purge_hosts(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.conn()?;
        let deleted = diesel::delete(hosts::table.filter(hosts::updated_at.lt(cutoff)))
            .execute(&mut conn)?;
        Ok(deleted as u64)
    }

    fn active_hosts(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn()?;
        Ok(hosts::table.select(hosts::hostname).load(&mut conn)?)
    }

    fn append_log(&self, entry: LogEntry) -> StoreResult<()> {
        let mut conn = self.conn()?;
        diesel::insert_into(execution_log::table)
            .values(NewLogRow {
                workflow_id: entry.workflow_id,
                log_text: &entry.log_text,
                pid: entry.pid,
                host: &entry.host,
            })
            .execute(&mut conn)?;
        Ok(())
    }
}
