use crate::diag::DiagnosticLog;
use crate::hosts::HostRegistry;
use crate::lock::{LockManager, LockToken};
use crate::state::State;
use crate::{StoreResult, WorkflowRecord};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Most stale workflows one sweep examines.
const STALE_SWEEP_LIMIT: i64 = 100;

/// Outcome counts of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub restarted: usize,
    pub restart_failed: usize,
    pub skipped_alive: usize,
    pub purged_hosts: u64,
}

/// Returns workflows whose owner died mid-execution to the pool.
///
/// A lock is only reclaimed once the owner is proven dead through the host
/// registry (and, on this host, a pid probe); a long-running but live owner
/// is left alone. The reclaim itself is conditional on the dead owner's
/// token, so a still-writing owner can never be preempted by mistake.
pub struct Reaper {
    state: State,
    hosts: HostRegistry,
    locks: LockManager,
    diag: DiagnosticLog,
    run_limit: chrono::Duration,
}

impl Reaper {
    /// `run_limit` is how long a workflow may stay IN_PROGRESS before its
    /// owner's liveness is questioned.
    pub fn new(state: State, run_limit: chrono::Duration) -> StoreResult<Self> {
        let token = LockToken::local()?;
        Ok(Self::new_with_token(state, token, run_limit))
    }

    pub fn new_with_token(state: State, token: LockToken, run_limit: chrono::Duration) -> Self {
        let hosts = HostRegistry::new_with_hostname(state.clone(), token.host.clone());
        let diag = DiagnosticLog::new(state.clone(), &token);
        let locks = LockManager::new_with_token(state.clone(), token);
        Self {
            state,
            hosts,
            locks,
            diag,
            run_limit,
        }
    }

    /// One full pass: heartbeat, host expiry, then examine stale locked
    /// workflows and reclaim those with dead owners. Every examined workflow
    /// produces exactly one logged outcome.
    pub fn sweep(&self, now: DateTime<Utc>) -> StoreResult<SweepStats> {
        let mut stats = SweepStats::default();
        stats.purged_hosts = self.hosts.heartbeat(now)?;
        let active_hosts = self.hosts.active_hosts()?;
        let cutoff = now - self.run_limit;
        let stale = self
            .state
            .store
            .stale_locked_workflows(cutoff, STALE_SWEEP_LIMIT)?;
        stats.examined = stale.len();
        for workflow in stale {
            match LockToken::parse(&workflow.lock) {
                Some(owner) => {
                    if self.locks.is_owner_alive(&owner, &active_hosts) {
                        info!(
                            "workflow is still running, leaving it alone. workflow_id={:?} owner={:?}",
                            workflow.workflow_id, workflow.lock
                        );
                        stats.skipped_alive += 1;
                        continue;
                    }
                    self.restart(&workflow, "owner is dead", &mut stats)?;
                }
                None => {
                    // No release statement will ever match a token we cannot
                    // attribute; left alone the row would stay locked forever.
                    self.restart(&workflow, "lock token is unparseable", &mut stats)?;
                }
            }
        }
        if stats.examined > 0 {
            info!(
                "sweep finished. examined={:?} restarted={:?} restart_failed={:?} skipped_alive={:?}",
                stats.examined, stats.restarted, stats.restart_failed, stats.skipped_alive
            );
        }
        Ok(stats)
    }

    fn restart(
        &self,
        workflow: &WorkflowRecord,
        reason: &str,
        stats: &mut SweepStats,
    ) -> StoreResult<()> {
        match self.locks.reclaim(workflow.workflow_id, &workflow.lock) {
            Ok(true) => {
                warn!(
                    "workflow restarted. workflow_id={:?} owner={:?} reason={:?}",
                    workflow.workflow_id, workflow.lock, reason
                );
                self.diag.append(
                    workflow.workflow_id,
                    format!("workflow restarted, {}", reason),
                );
                stats.restarted += 1;
            }
            Ok(false) => {
                // The lock moved under us. This is OK, the next sweep will
                // see the new owner.
                info!(
                    "workflow restart lost the race. workflow_id={:?}",
                    workflow.workflow_id
                );
                stats.restart_failed += 1;
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                error!(
                    "workflow restart failed. workflow_id={:?} error={:?}",
                    workflow.workflow_id, err
                );
                stats.restart_failed += 1;
            }
        }
        Ok(())
    }

    /// Moves the reaper onto its own thread, sweeping every `interval`.
    pub fn start(self, interval: Duration) -> ReaperHandle {
        let reaper = Arc::new(self);
        let stop: Arc<AtomicU8> = Arc::new(AtomicU8::new(0));
        let stop_clone = stop.clone();
        thread::spawn(move || {
            while stop_clone.load(Ordering::SeqCst) == 0 {
                info!("Starting reaper thread");
                // In case the sweep thread crashes we can restart it without
                // blocking the embedding application.
                let reaper_clone = reaper.clone();
                let stop_clone_clone = stop_clone.clone();
                let handle = thread::spawn(move || {
                    while stop_clone_clone.load(Ordering::SeqCst) == 0 {
                        if let Err(err) = reaper_clone.sweep(Utc::now()) {
                            error!("reaper sweep failed. error={:?}", err);
                        }
                        thread::sleep(interval);
                    }
                });
                if let Err(err) = handle.join() {
                    if let Some(msg) = err.downcast_ref::<String>() {
                        error!("Reaper thread panicked: {:?}", msg);
                    } else {
                        error!("Reaper thread panicked with unexpected error: {:?}", err);
                    }
                    thread::sleep(Duration::from_secs(1));
                } else {
                    error!("Reaping has stopped");
                }
            }
            stop_clone.store(2, Ordering::SeqCst);
        });
        ReaperHandle { stop_flag: stop }
    }
}

#[derive(Clone)]
pub struct ReaperHandle {
    stop_flag: Arc<AtomicU8>,
}

impl ReaperHandle {
    /// Signals the reaper thread to stop and waits for the acknowledgement.
    /// False when the thread did not acknowledge within the bounded wait.
    pub fn stop(&self) -> bool {
        info!("Stopping reaper");
        self.stop_flag.store(1, Ordering::SeqCst);
        for _ in 0..1000 {
            if self.stop_flag.load(Ordering::SeqCst) == 2 {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        error!("Reaper thread did not stop");
        false
    }
}
