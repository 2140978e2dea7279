use crate::state::State;
use crate::{StoreError, StoreResult};
use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;

lazy_static! {
    /// A host whose newest heartbeat is older than this is expired: its row
    /// is purged and every lock it holds becomes reclaimable.
    static ref HOST_EXPIRY: Duration = Duration::seconds(300);
}

/// Keeps this host's row in the shared store fresh and expires the rows of
/// hosts that stopped beating.
pub struct HostRegistry {
    state: State,
    hostname: String,
}

impl HostRegistry {
    pub fn new(state: State) -> StoreResult<Self> {
        let hostname = hostname::get()
            .map_err(|err| StoreError::Configuration(format!("cannot resolve hostname: {}", err)))?
            .to_string_lossy()
            .into_owned();
        Ok(Self::new_with_hostname(state, hostname))
    }

    pub fn new_with_hostname(state: State, hostname: String) -> Self {
        Self { state, hostname }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// One heartbeat round: refresh our own row, then drop rows that have
    /// been silent past the expiry window. Returns how many were dropped.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.state.store.upsert_host(&self.hostname, now)?;
        let purged = self.state.store.purge_hosts(now - *HOST_EXPIRY)?;
        if purged > 0 {
            log::debug!("purged expired host rows. count={:?}", purged);
        }
        Ok(purged)
    }

    /// Hostnames with a live heartbeat, the liveness ground truth for the
    /// reaper's owner checks.
    pub fn active_hosts(&self) -> StoreResult<Vec<String>> {
        self.state.store.active_hosts()
    }
}
