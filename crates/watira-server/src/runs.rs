use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use watira_core::{RunId, SessionId};
use watira_store::SessionRepo;

struct ActiveRun {
    session_id: SessionId,
    cancel: CancellationToken,
}

/// Turns currently streaming. Sessions with an entry here are never
/// reclaimed or deleted.
///
/// Resolving a session and registering its run happen under the admission
/// lock, as do sweeps and deletes, so a session cannot vanish between being
/// looked up and being protected.
#[derive(Default)]
pub struct ActiveRuns {
    runs: DashMap<RunId, ActiveRun>,
    admission: Mutex<()>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold while resolving a session and starting its run, or while
    /// removing sessions. Never held across an await.
    pub fn admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock()
    }

    /// Register a run. The entry lives until the returned guard is dropped.
    pub fn start(
        self: &Arc<Self>,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> RunGuard {
        let run_id = RunId::new();
        self.runs.insert(
            run_id.clone(),
            ActiveRun {
                session_id,
                cancel,
            },
        );
        RunGuard {
            runs: Arc::clone(self),
            run_id,
        }
    }

    pub fn count(&self) -> usize {
        self.runs.len()
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.runs.iter().any(|r| &r.session_id == session_id)
    }

    pub fn protected_sessions(&self) -> HashSet<SessionId> {
        self.runs.iter().map(|r| r.session_id.clone()).collect()
    }

    /// Cancel every run on `session_id`. Returns how many were signalled.
    pub fn abort_session(&self, session_id: &SessionId) -> usize {
        let mut aborted = 0;
        for run in self.runs.iter().filter(|r| &r.session_id == session_id) {
            run.cancel.cancel();
            aborted += 1;
        }
        aborted
    }

    /// Cancel everything, used on shutdown.
    pub fn abort_all(&self) {
        for run in self.runs.iter() {
            run.cancel.cancel();
        }
    }
}

/// Removes its run from [`ActiveRuns`] on drop.
pub struct RunGuard {
    runs: Arc<ActiveRuns>,
    run_id: RunId,
}

impl RunGuard {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.runs.remove(&self.run_id);
    }
}

/// Start a background task that periodically deletes idle sessions, skipping
/// those with a turn in flight.
pub fn start_sweeper(
    sessions: Arc<SessionRepo>,
    runs: Arc<ActiveRuns>,
    idle_for: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            sweep_once(&sessions, &runs, idle_for);
        }
    })
}

/// One reclamation pass. Returns the reclaimed ids.
pub fn sweep_once(sessions: &SessionRepo, runs: &ActiveRuns, idle_for: Duration) -> Vec<SessionId> {
    let _admission = runs.admission();
    let protected = runs.protected_sessions();
    match sessions.reclaim_idle(idle_for, &protected) {
        Ok(reclaimed) => {
            if !reclaimed.is_empty() {
                tracing::info!(reclaimed = reclaimed.len(), "idle session sweep");
            }
            reclaimed
        }
        Err(e) => {
            tracing::warn!(error = %e, "idle session sweep failed");
            Vec::new()
        }
    }
}
