use cadencecore::{NotFoundError, Run, RunId, RunSnapshot, RunState};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

struct RunEntry {
    snapshot: watch::Sender<RunSnapshot>,
    cancellation: CancellationToken,
}

/// Live status of the runs this process has queued but not finished
#[derive(Default)]
pub struct RunStore {
    entries: RwLock<HashMap<RunId, RunEntry>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new run; returns the token that cancels it
    pub async fn insert(&self, run: &Run) -> CancellationToken {
        let cancellation = CancellationToken::new();
        let (snapshot, _) = watch::channel(run.snapshot());
        self.entries.write().await.insert(
            run.id,
            RunEntry {
                snapshot,
                cancellation: cancellation.clone(),
            },
        );
        cancellation
    }

    pub async fn cancellation(&self, run_id: RunId) -> Option<CancellationToken> {
        self.entries
            .read()
            .await
            .get(&run_id)
            .map(|entry| entry.cancellation.clone())
    }

    pub async fn mark_running(&self, run_id: RunId) {
        if let Some(entry) = self.entries.read().await.get(&run_id) {
            entry.snapshot.send_if_modified(|snapshot| {
                if snapshot.state != RunState::Scheduled {
                    return false;
                }
                snapshot.state = RunState::Running;
                snapshot.started_at = Some(Utc::now());
                true
            });
        }
    }

    /// Publish the terminal snapshot produced by the executor and stop
    /// tracking the run. Existing subscribers keep the final snapshot.
    pub async fn complete(&self, snapshot: RunSnapshot) {
        if let Some(entry) = self.entries.write().await.remove(&snapshot.id) {
            entry.snapshot.send_replace(snapshot);
        }
    }

    pub async fn get(&self, run_id: RunId) -> Option<RunSnapshot> {
        self.entries
            .read()
            .await
            .get(&run_id)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    /// Request cancellation; returns the state observed at the time.
    pub async fn cancel(&self, run_id: RunId) -> Result<RunState, NotFoundError> {
        let entries = self.entries.read().await;
        let entry = entries.get(&run_id).ok_or(NotFoundError::Run(run_id))?;
        let state = entry.snapshot.borrow().state;
        if !state.is_terminal() {
            entry.cancellation.cancel();
        }
        Ok(state)
    }

    pub async fn subscribe(&self, run_id: RunId) -> Option<watch::Receiver<RunSnapshot>> {
        self.entries
            .read()
            .await
            .get(&run_id)
            .map(|entry| entry.snapshot.subscribe())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshots of runs that have not finished yet
    pub async fn active(&self) -> Vec<RunSnapshot> {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.snapshot.borrow().clone())
            .filter(|snapshot| !snapshot.state.is_terminal())
            .collect()
    }
}
