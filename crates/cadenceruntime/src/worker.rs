use crate::{executor::RunExecutor, run_log::RunLog, run_store::RunStore};
use cadencecore::Run;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub(crate) type RunQueue = Arc<Mutex<mpsc::UnboundedReceiver<Run>>>;

/// Drains the run queue, one run at a time
pub(crate) struct Worker {
    pub id: usize,
    pub queue: RunQueue,
    pub executor: Arc<RunExecutor>,
    pub runs: Arc<RunStore>,
    pub run_log: Arc<dyn RunLog>,
    pub shutdown: CancellationToken,
}

impl Worker {
    pub async fn run(self) {
        tracing::debug!(worker = self.id, "Worker started");
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    run = queue.recv() => run,
                }
            };
            let Some(run) = next else {
                break;
            };
            let cancellation = self.cancellation(&run).await;
            self.process(run, cancellation).await;
        }
        self.cancel_queued().await;
        tracing::debug!(worker = self.id, "Worker stopped");
    }

    async fn cancellation(&self, run: &Run) -> CancellationToken {
        match self.runs.cancellation(run.id).await {
            Some(token) => token,
            None => {
                tracing::warn!(worker = self.id, run_id = %run.id, "Dequeued a run the store does not track");
                CancellationToken::new()
            }
        }
    }

    /// Finish every run left in the queue as cancelled
    async fn cancel_queued(&self) {
        let mut queue = self.queue.lock().await;
        while let Ok(run) = queue.try_recv() {
            tracing::info!(worker = self.id, run_id = %run.id, "Cancelling queued run on shutdown");
            let cancellation = self.cancellation(&run).await;
            cancellation.cancel();
            self.process(run, cancellation).await;
        }
    }

    async fn process(&self, run: Run, cancellation: CancellationToken) {
        let run_id = run.id;
        if !cancellation.is_cancelled() {
            self.runs.mark_running(run_id).await;
        }
        let finished = self.executor.drain_and_execute(run, cancellation).await;
        let snapshot = finished.snapshot();

        if let Err(e) = self.run_log.append(snapshot.clone()).await {
            tracing::error!(worker = self.id, %run_id, "Failed to record run: {}", e);
        }
        self.runs.complete(snapshot).await;
    }
}
