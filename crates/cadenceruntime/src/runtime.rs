use crate::{
    config::RuntimeConfig,
    deployments::DeploymentRegistry,
    executor::RunExecutor,
    registry::TaskRegistry,
    run_log::{MemoryRunLog, RunLog},
    run_store::RunStore,
    scheduler::Scheduler,
    worker::{RunQueue, Worker},
};
use cadencecore::{
    Deployment, DeploymentSpec, EventBus, FlowGraph, NotFoundError, OrchestratorError, Result,
    Run, RunEvent, RunId, RunSnapshot, RunState, RunStatus, RunTrigger, Value,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ties the registries, scheduler, run queue and workers together
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    deployments: Arc<DeploymentRegistry>,
    scheduler: Mutex<Scheduler>,
    executor: Arc<RunExecutor>,
    event_bus: Arc<EventBus>,
    runs: Arc<RunStore>,
    run_log: Arc<dyn RunLog>,
    queue: mpsc::UnboundedSender<Run>,
    receiver: RunQueue,
    shutdown: CancellationToken,
    config: RuntimeConfig,
}

impl Orchestrator {
    /// Create an orchestrator with an in-memory run log
    pub fn new(registry: Arc<TaskRegistry>, config: RuntimeConfig) -> Self {
        Self::with_run_log(registry, config, Arc::new(MemoryRunLog::new()))
    }

    pub fn with_run_log(
        registry: Arc<TaskRegistry>,
        config: RuntimeConfig,
        run_log: Arc<dyn RunLog>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Arc::new(RunExecutor::new(
            registry.clone(),
            event_bus.clone(),
            config.max_parallel_elements,
        ));
        let (queue, receiver) = mpsc::unbounded_channel();

        Self {
            registry,
            deployments: Arc::new(DeploymentRegistry::new()),
            scheduler: Mutex::new(Scheduler::new()),
            executor,
            event_bus,
            runs: Arc::new(RunStore::new()),
            run_log,
            queue,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn deployments(&self) -> &Arc<DeploymentRegistry> {
        &self.deployments
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Validate the flow against the registered tasks and deploy it
    pub async fn deploy(&self, spec: DeploymentSpec) -> Result<Arc<Deployment>> {
        let metadata = spec.metadata();
        let flow = FlowGraph::define(spec.flow, self.registry.as_ref())?;
        let deployment = self
            .deployments
            .deploy(
                &spec.name,
                Arc::new(flow),
                spec.schedule,
                spec.parameters,
                spec.environment,
                metadata,
            )
            .await?;
        Ok(deployment)
    }

    pub async fn deploy_all(
        &self,
        specs: impl IntoIterator<Item = DeploymentSpec>,
    ) -> Result<Vec<Arc<Deployment>>> {
        let mut deployed = Vec::new();
        for spec in specs {
            deployed.push(self.deploy(spec).await?);
        }
        Ok(deployed)
    }

    pub async fn remove_deployment(&self, name: &str) -> Result<()> {
        self.deployments.remove(name).await?;
        Ok(())
    }

    pub async fn get_deployment(&self, name: &str) -> Result<Arc<Deployment>> {
        Ok(self.deployments.get(name).await?)
    }

    pub async fn list_deployments(&self) -> Vec<Arc<Deployment>> {
        self.deployments.list().await
    }

    /// Manually trigger a deployment. Returns as soon as the run is queued;
    /// its outcome is only visible through `status`.
    pub async fn trigger(&self, name: &str, overrides: HashMap<String, Value>) -> Result<RunId> {
        let run = Scheduler::manual(&self.deployments, name, overrides).await?;
        self.enqueue(run).await
    }

    /// Evaluate every deployment's trigger at `now` and enqueue due runs
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let mut scheduler = self.scheduler.lock().await;
        let deployments = self.deployments.list().await;
        let due = scheduler.tick(now, &deployments);

        let mut run_ids = Vec::with_capacity(due.len());
        for run in due {
            run_ids.push(self.enqueue(run).await?);
        }
        Ok(run_ids)
    }

    /// Next fire time of every enabled deployment
    pub async fn upcoming(&self, now: DateTime<Utc>) -> Vec<(String, DateTime<Utc>)> {
        let scheduler = self.scheduler.lock().await;
        self.deployments
            .list()
            .await
            .iter()
            .filter_map(|d| scheduler.next_fire_time(d, now).map(|t| (d.name.clone(), t)))
            .collect()
    }

    async fn enqueue(&self, run: Run) -> Result<RunId> {
        let run_id = run.id;
        self.runs.insert(&run).await;
        self.event_bus.emit(RunEvent::RunScheduled {
            run_id,
            deployment: run.deployment.clone(),
            manual: run.trigger == RunTrigger::Manual,
            timestamp: Utc::now(),
        });
        tracing::debug!(%run_id, deployment = %run.deployment, "Enqueued run");

        self.queue
            .send(run)
            .map_err(|_| OrchestratorError::Infrastructure("run queue is closed".to_string()))?;
        Ok(run_id)
    }

    /// Spawn the worker pool draining the run queue
    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        tracing::info!(workers, "Starting workers");
        (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.receiver.clone(),
                    executor: self.executor.clone(),
                    runs: self.runs.clone(),
                    run_log: self.run_log.clone(),
                    shutdown: self.shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }

    /// Drive the scheduler from the wall clock until shutdown
    pub fn spawn_clock(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = orchestrator.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = orchestrator.tick(Utc::now()).await {
                            tracing::error!("Scheduler tick failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Scheduler clock stopped");
        })
    }

    pub async fn snapshot(&self, run_id: RunId) -> Result<RunSnapshot> {
        if let Some(snapshot) = self.runs.get(run_id).await {
            return Ok(snapshot);
        }
        self.run_log
            .get(run_id)
            .await
            .ok_or_else(|| NotFoundError::Run(run_id).into())
    }

    pub async fn status(&self, run_id: RunId) -> Result<RunStatus> {
        Ok(self.snapshot(run_id).await?.status())
    }

    /// Cancel a run that has not finished. Returns the state it was in.
    pub async fn cancel(&self, run_id: RunId) -> Result<RunState> {
        let state = match self.runs.cancel(run_id).await {
            Ok(state) => state,
            Err(missing) => match self.run_log.get(run_id).await {
                Some(snapshot) => snapshot.state,
                None => return Err(missing.into()),
            },
        };
        if !state.is_terminal() {
            tracing::info!(%run_id, %state, "Cancellation requested");
        }
        Ok(state)
    }

    /// Wait until a run reaches a terminal state
    pub async fn wait(&self, run_id: RunId) -> Result<RunSnapshot> {
        let Some(mut receiver) = self.runs.subscribe(run_id).await else {
            return self.snapshot(run_id).await;
        };
        let finished = receiver
            .wait_for(|snapshot| snapshot.state.is_terminal())
            .await
            .map(|snapshot| snapshot.clone());
        match finished {
            Ok(snapshot) => Ok(snapshot),
            // Store entry gone; the run log has the final snapshot
            Err(_) => self.snapshot(run_id).await,
        }
    }

    /// Terminal runs of a deployment, oldest first
    pub async fn history(&self, deployment: &str) -> Vec<RunSnapshot> {
        self.run_log.history(deployment).await
    }

    pub async fn active_runs(&self) -> Vec<RunSnapshot> {
        self.runs.active().await
    }

    /// Subscribe to run events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Stop the workers and the clock. Runs in flight finish first; runs
    /// still queued are finished as cancelled by the stopping workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
