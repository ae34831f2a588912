use async_trait::async_trait;
use cadencecore::{RunId, RunLogError, RunSnapshot};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Append-only record of terminal runs, keyed by deployment name
#[async_trait]
pub trait RunLog: Send + Sync {
    /// Record a terminal run. Non-terminal snapshots and run ids that were
    /// already recorded are rejected.
    async fn append(&self, snapshot: RunSnapshot) -> Result<(), RunLogError>;

    /// Terminal runs of one deployment, oldest first
    async fn history(&self, deployment: &str) -> Vec<RunSnapshot>;

    async fn get(&self, run_id: RunId) -> Option<RunSnapshot>;
}

#[derive(Default)]
struct Entries {
    by_deployment: HashMap<String, Vec<RunSnapshot>>,
    index: HashMap<RunId, (String, usize)>,
}

/// In-process run log
#[derive(Default)]
pub struct MemoryRunLog {
    entries: RwLock<Entries>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn append(&self, snapshot: RunSnapshot) -> Result<(), RunLogError> {
        if !snapshot.state.is_terminal() {
            return Err(RunLogError::NotTerminal(snapshot.id));
        }

        let mut entries = self.entries.write().await;
        if entries.index.contains_key(&snapshot.id) {
            return Err(RunLogError::AlreadyRecorded(snapshot.id));
        }

        let history = entries
            .by_deployment
            .entry(snapshot.deployment.clone())
            .or_default();
        let position = history.len();
        let key = (snapshot.deployment.clone(), position);
        let run_id = snapshot.id;
        history.push(snapshot);
        entries.index.insert(run_id, key);
        Ok(())
    }

    async fn history(&self, deployment: &str) -> Vec<RunSnapshot> {
        self.entries
            .read()
            .await
            .by_deployment
            .get(deployment)
            .cloned()
            .unwrap_or_default()
    }

    async fn get(&self, run_id: RunId) -> Option<RunSnapshot> {
        let entries = self.entries.read().await;
        let (deployment, position) = entries.index.get(&run_id)?;
        entries
            .by_deployment
            .get(deployment)
            .and_then(|history| history.get(*position))
            .cloned()
    }
}
