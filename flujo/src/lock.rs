use crate::state::State;
use crate::{StoreError, StoreResult, WorkflowId};
use chrono::{DateTime, Utc};
use std::fmt;

/// Identity of a lock holder, written into the workflow row's lock column as
/// `host:pid`. The empty string is the unlocked sentinel and is never a valid
/// token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken {
    pub host: String,
    pub pid: u32,
}

impl LockToken {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
        }
    }

    /// Token for the current process.
    pub fn local() -> StoreResult<Self> {
        let host = hostname::get()
            .map_err(|err| StoreError::Configuration(format!("cannot resolve hostname: {}", err)))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            host,
            pid: std::process::id(),
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.host, self.pid)
    }

    /// Parses a lock column value. Splits on the last colon so hostnames
    /// containing colons survive the round trip. `None` means the column
    /// holds something no release statement will ever match by token, which
    /// the reaper treats as an orphaned lock.
    pub fn parse(raw: &str) -> Option<Self> {
        let (host, pid) = raw.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let pid = pid.parse::<u32>().ok()?;
        Some(Self {
            host: host.to_string(),
            pid,
        })
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.pid)
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    // No procfs to probe; treat the process as still running.
    true
}

/// Issues and releases workflow locks under this process's token.
///
/// Mutual exclusion rests entirely on the store's conditional updates: losing
/// a race is reported as `false`, never as an error.
pub struct LockManager {
    state: State,
    token: LockToken,
}

impl LockManager {
    pub fn new(state: State) -> StoreResult<Self> {
        Ok(Self {
            token: LockToken::local()?,
            state,
        })
    }

    pub fn new_with_token(state: State, token: LockToken) -> Self {
        Self { state, token }
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// True when this call took the lock, false when some holder (possibly
    /// this same process) already has it. IN_PROGRESS, started_at and the
    /// error count move together with the lock.
    pub fn acquire(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> StoreResult<bool> {
        self.state
            .store
            .lock_workflow(workflow_id, &self.token.encode(), now)
    }

    /// Releases a lock held under this process's token.
    pub fn release(&self, workflow_id: WorkflowId) -> StoreResult<bool> {
        self.state
            .store
            .release_workflow(workflow_id, &self.token.encode())
    }

    /// Releases a lock held under someone else's raw token. Only called once
    /// the owner has been decided dead; the conditional update still protects
    /// against the owner writing concurrently.
    pub fn reclaim(&self, workflow_id: WorkflowId, owner_token: &str) -> StoreResult<bool> {
        self.state.store.release_workflow(workflow_id, owner_token)
    }

    /// Liveness verdict for a lock owner, given the current host registry
    /// snapshot. A host with no heartbeat row is dead along with everything
    /// it ran. On this process's own host the pid is probed directly; on a
    /// live remote host the owner gets the benefit of the doubt.
    pub fn is_owner_alive(&self, owner: &LockToken, active_hosts: &[String]) -> bool {
        if !active_hosts.iter().any(|host| *host == owner.host) {
            return false;
        }
        if owner.host == self.token.host {
            return process_exists(owner.pid);
        }
        true
    }
}
