use crate::lock::LockToken;
use crate::state::State;
use crate::{LogEntry, WorkflowId};

/// Append-only execution log tied to one process identity.
///
/// Diagnostics are best-effort by contract: a failure to write a line is
/// itself logged and swallowed, never surfaced to the caller.
pub struct DiagnosticLog {
    state: State,
    host: String,
    pid: i32,
}

impl DiagnosticLog {
    pub fn new(state: State, identity: &LockToken) -> Self {
        Self {
            state,
            host: identity.host.clone(),
            pid: identity.pid as i32,
        }
    }

    pub fn append(&self, workflow_id: WorkflowId, log_text: impl Into<String>) {
        let entry = LogEntry {
            workflow_id,
            log_text: log_text.into(),
            pid: self.pid,
            host: self.host.clone(),
        };
        if let Err(err) = self.state.store.append_log(entry) {
            log::warn!(
                "could not append execution log line. workflow_id={:?} error={:?}",
                workflow_id,
                err
            );
        }
    }
}
