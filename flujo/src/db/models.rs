//! Row structs mapping the Diesel schema onto the domain records.
//!
//! Reads go through the `*Row` structs and `TryFrom`, so a row carrying an
//! unknown status string surfaces as [`StoreError::Corrupt`] instead of
//! panicking inside a query. Writes go through the borrowed `New*Row` structs.

use crate::db::schema::{events, execution_log, hosts, subscriptions, workflows};
use crate::{EventRecord, EventStatus, StoreError, WorkflowRecord, WorkflowStatus};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

#[derive(Debug, Queryable)]
pub struct WorkflowRow {
    pub workflow_id: i64,
    pub workflow_type: String,
    pub context: Value,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub lock: String,
    pub error_count: i32,
}

impl TryFrom<WorkflowRow> for WorkflowRecord {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(WorkflowRecord {
            workflow_id: row.workflow_id,
            workflow_type: row.workflow_type,
            context: row.context,
            scheduled_at: row.scheduled_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status: WorkflowStatus::parse(&row.status)?,
            lock: row.lock,
            error_count: row.error_count,
        })
    }
}

#[derive(Debug, Queryable)]
pub struct EventRow {
    pub event_id: i64,
    pub event_type: String,
    pub context: Value,
    pub status: String,
    pub workflow_id: i64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            context: row.context,
            status: EventStatus::parse(&row.status)?,
            workflow_id: row.workflow_id,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workflows)]
pub struct NewWorkflowRow<'a> {
    pub workflow_type: &'a str,
    pub context: &'a Value,
    pub scheduled_at: DateTime<Utc>,
    pub status: &'a str,
    pub lock: &'a str,
    pub error_count: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = events)]
pub struct NewEventRow<'a> {
    pub event_type: &'a str,
    pub context: &'a Value,
    pub status: &'a str,
    pub workflow_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = subscriptions)]
pub struct NewSubscriptionRow<'a> {
    pub workflow_id: i64,
    pub status: &'a str,
    pub event_type: &'a str,
    pub context_key: &'a str,
    pub context_value: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = hosts)]
pub struct NewHostRow<'a> {
    pub hostname: &'a str,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = execution_log)]
pub struct NewLogRow<'a> {
    pub workflow_id: i64,
    pub log_text: &'a str,
    pub pid: i32,
    pub host: &'a str,
}
