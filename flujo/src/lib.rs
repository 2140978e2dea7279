//! Persistence and coordination core for long-running workflows.
//!
//! Workflow instances, their event subscriptions and the locks that serialize
//! their execution all live in a shared relational store. Worker processes on
//! any number of hosts poll that store for due work, win execution rights
//! through a conditional update, run the workflow and persist it back. There
//! is no broker and no lock service; the store is the only synchronization
//! primitive.

pub mod db;
pub mod diag;
pub mod hosts;
pub mod lock;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod worker;

use chrono::{DateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use thiserror::Error;

/// Name under which a workflow implementation is registered. Stored on the
/// workflow row and resolved back to behavior through a [`WorkflowRegistry`].
pub type WorkflowType = String;
/// Store-generated workflow identity.
pub type WorkflowId = i64;
/// Store-generated event row identity.
pub type EventId = i64;
/// Opaque state blob produced and consumed only by the workflow itself.
pub type WorkflowContext = serde_json::Value;

/// Owner id recorded on event rows when no subscription matched. Never a real
/// workflow id; real ids start at 1.
pub const NO_SUBSCRIBERS_WORKFLOW_ID: WorkflowId = 0;

/// Reserved subscription event type under which uniqueness fingerprints are
/// stored. Rows of this type assert "a workflow with this (key, value) already
/// exists" and are never matched during routing.
pub const UNIQUENESS_EVENT_TYPE: &str = "_UNIQUE_";

/// Context key/value used by a subscription that matches any event of its
/// type.
pub const WILDCARD: &str = "";

/// Lifecycle of a workflow row.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// Eligible for execution once its schedule or a pending event is due.
    Active,
    /// Locked by a worker process.
    InProgress,
    /// Terminal. Finished workflows are never deleted.
    Finished,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Active => "ACTIVE",
            Self::InProgress => "IN_PROGRESS",
            Self::Finished => "FINISHED",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "ACTIVE" => Ok(Self::Active),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "FINISHED" => Ok(Self::Finished),
            other => Err(StoreError::Corrupt(format!(
                "unknown workflow status '{}'",
                other
            ))),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self, Self::Active)
    }
}

impl Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of an event row.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventStatus {
    /// Delivered, not yet consumed by the finish cascade.
    Active,
    /// Closed because the owning workflow finished.
    Processed,
    /// Sentinel row recorded when routing matched nothing.
    NoSubscribers,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Active => "ACTIVE",
            Self::Processed => "PROCESSED",
            Self::NoSubscribers => "NO_SUBSCRIBERS",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "ACTIVE" => Ok(Self::Active),
            "PROCESSED" => Ok(Self::Processed),
            "NO_SUBSCRIBERS" => Ok(Self::NoSubscribers),
            other => Err(StoreError::Corrupt(format!(
                "unknown event status '{}'",
                other
            ))),
        }
    }
}

impl Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a subscription row.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    /// Retired because the owning workflow finished. Stops matching.
    Finished,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "ACTIVE" => Ok(Self::Active),
            "FINISHED" => Ok(Self::Finished),
            other => Err(StoreError::Corrupt(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

impl Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One event filter a workflow wants to be woken by.
///
/// `context_values` may name several acceptable values; registration inserts
/// one subscription row per value. An empty value set registers the single
/// wildcard pair instead.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionFilter {
    pub event_type: String,
    pub context_key: String,
    pub context_values: Vec<String>,
}

impl SubscriptionFilter {
    pub fn new(event_type: &str, context_key: &str, context_values: Vec<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            context_key: context_key.to_string(),
            context_values,
        }
    }

    /// A filter matching every event of the given type.
    pub fn wildcard(event_type: &str) -> Self {
        Self::new(event_type, WILDCARD, vec![])
    }
}

/// The (key, value) fingerprint that makes a workflow globally unique.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Uniqueness {
    pub key: String,
    pub value: String,
}

impl Uniqueness {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// A workflow row as read back from the store.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WorkflowRecord {
    pub workflow_id: WorkflowId,
    pub workflow_type: WorkflowType,
    pub context: WorkflowContext,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    /// '' when unlocked, otherwise the owner's encoded [`lock::LockToken`].
    pub lock: String,
    pub error_count: i32,
}

/// An event row as read back from the store. The same logical occurrence fans
/// out to one row per subscribing workflow.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct EventRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub context: serde_json::Value,
    pub status: EventStatus,
    pub workflow_id: WorkflowId,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A subscription row as read back from the store.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SubscriptionRecord {
    pub subscription_id: i64,
    pub workflow_id: WorkflowId,
    pub status: SubscriptionStatus,
    pub event_type: String,
    pub context_key: String,
    pub context_value: String,
}

/// A heartbeat row for one worker host.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HostRecord {
    pub hostname: String,
    pub updated_at: DateTime<Utc>,
}

/// One appended execution log line. Write-only in this core.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct LogEntry {
    pub workflow_id: WorkflowId,
    pub log_text: String,
    pub pid: i32,
    pub host: String,
}

/// Error reported by a workflow execution round. Whether the round is retried
/// is the workflow's own call; the core only persists the outcome.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    pub message: String,
    pub retriable: bool,
}

impl WorkflowError {
    pub fn retriable(message: String) -> Self {
        Self {
            message,
            retriable: true,
        }
    }

    pub fn permanent(message: String) -> Self {
        Self {
            message,
            retriable: false,
        }
    }
}

impl Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Classified failure of a store-backed operation.
///
/// Contention is never represented here: losing a conditional update is a
/// normal outcome and shows up as `false`/`None` returns instead. Fatal
/// variants mean the process cannot make progress and should stop; everything
/// else is logged and retried on a later pass.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A statement or transaction failed and was rolled back in full.
    #[error("database error: {0}")]
    Database(String),
    /// No connection could be opened or reused.
    #[error("connection unavailable: {0}")]
    Connection(String),
    /// Required configuration is missing or unusable.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An expected table is absent. Raised by startup probing only.
    #[error("schema missing: table '{0}' not found")]
    SchemaMissing(String),
    /// A stored row does not parse back into its domain shape.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// No factory registered for the stored workflow type.
    #[error("workflow type '{0}' not found in registry")]
    UnknownWorkflowType(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            *self,
            Self::Connection(_) | Self::Configuration(_) | Self::SchemaMissing(_)
        )
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                Self::Connection(info.message().to_string())
            }
            DieselError::DatabaseError(kind, info) => {
                Self::Database(format!("{:?}: {}", kind, info.message()))
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Shorthand for results carrying a [`StoreError`].
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Contract between the coordination core and a workflow implementation.
///
/// The core never interprets the context blob; it persists whatever the
/// workflow reports and schedules the next round at the time the workflow
/// asks for.
#[cfg_attr(test, automock)]
pub trait Workflow: Send {
    fn id(&self) -> WorkflowId;

    fn set_id(&mut self, workflow_id: WorkflowId);

    fn workflow_type(&self) -> &str;

    fn context(&self) -> WorkflowContext;

    fn set_context(&mut self, context: WorkflowContext);

    /// Injected from the stored row on reconstruction, before any budget or
    /// erroring question is asked.
    fn set_error_count(&mut self, error_count: i32);

    /// Earliest time the next execution round should run.
    fn scheduled_at(&self) -> DateTime<Utc>;

    /// Executes one round of work. `events` holds the workflow's still-open
    /// event rows, oldest first.
    fn run(&mut self, events: &[EventRecord]) -> Result<(), WorkflowError>;

    fn is_finished(&self) -> bool;

    /// Forces the finished report. Called when the error budget is exhausted;
    /// the decision is persisted by the next save.
    fn mark_finished(&mut self);

    /// True once the workflow judges its consecutive-error count excessive.
    fn exceeded_error_budget(&self) -> bool;

    /// True when the round that just ran ended in an error.
    fn is_erroring(&self) -> bool;

    /// Event filters this workflow wants registered at creation.
    fn subscriptions(&self) -> Vec<SubscriptionFilter>;

    /// Fingerprint enforced when the workflow is created with `unique=true`.
    fn uniqueness(&self) -> Option<Uniqueness>;
}

#[cfg_attr(test, automock)]
pub trait WorkflowFactory: Send + Sync {
    /// Builds a blank instance. Identity and context are injected by the
    /// store after construction.
    fn create(&self) -> Box<dyn Workflow>;

    fn workflow_type(&self) -> &str;
}

/// Maps stored type tags back to workflow instances.
pub trait WorkflowRegistry: Send + Sync {
    /// Unknown tags are an explicit [`StoreError::UnknownWorkflowType`]
    /// outcome, never a none-like sentinel.
    fn create_workflow(&self, workflow_type: &str) -> StoreResult<Box<dyn Workflow>>;
}

/// Contract for inbound events handed to the router.
#[cfg_attr(test, automock)]
pub trait Event {
    fn event_type(&self) -> &str;

    fn context(&self) -> serde_json::Value;

    /// Context (key, value) pairs to test against subscriptions, in test
    /// order. May be empty; the router then tests only the wildcard pair.
    fn routing_pairs(&self) -> Vec<(String, String)>;

    /// Identity used in log lines only.
    fn identity(&self) -> String;
}
