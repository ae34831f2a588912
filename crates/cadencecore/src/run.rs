use crate::{Deployment, DeploymentId, FlowGraph, RunError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Scheduled,
    Running,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Crashed | RunState::Cancelled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Scheduled => "scheduled",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Crashed => "crashed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What created a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTrigger {
    Schedule { scheduled_for: DateTime<Utc> },
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
    Crashed(String),
    Cancelled,
}

/// One attempt of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<usize>,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One execution of a deployment.
///
/// A run carries its own snapshot of the deployment's flow graph, so
/// redeploying or removing the deployment never affects it.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub deployment: String,
    pub deployment_id: DeploymentId,
    pub flow: Arc<FlowGraph>,
    pub parameters: HashMap<String, Value>,
    pub env: HashMap<String, String>,
    pub trigger: RunTrigger,
    pub created_at: DateTime<Utc>,
    pub state: RunState,
    pub attempts: Vec<AttemptRecord>,
    pub outputs: HashMap<String, Value>,
    pub error: Option<RunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        deployment: &Deployment,
        parameters: HashMap<String, Value>,
        trigger: RunTrigger,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment: deployment.name.clone(),
            deployment_id: deployment.id,
            flow: deployment.flow.clone(),
            parameters,
            env: deployment.environment.env_vars.clone(),
            trigger,
            created_at,
            state: RunState::Scheduled,
            attempts: Vec::new(),
            outputs: HashMap::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Run with the deployment's default parameters, created by the scheduler
    pub fn scheduled(
        deployment: &Deployment,
        scheduled_for: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            deployment,
            deployment.parameters.clone(),
            RunTrigger::Schedule { scheduled_for },
            created_at,
        )
    }

    /// Run with overrides merged over the defaults
    pub fn manual(deployment: &Deployment, overrides: HashMap<String, Value>) -> Self {
        Self::new(
            deployment,
            deployment.effective_parameters(overrides),
            RunTrigger::Manual,
            Utc::now(),
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn start(&mut self) {
        if self.state == RunState::Scheduled {
            self.state = RunState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Move to a terminal state. Terminal runs are never changed again.
    pub fn finish(&mut self, state: RunState, error: Option<RunError>) {
        debug_assert!(state.is_terminal());
        if self.is_terminal() {
            return;
        }
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Attempts recorded for one step, in recording order
    pub fn attempts_for<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a AttemptRecord> + 'a {
        self.attempts.iter().filter(move |a| a.step == step)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot::from(self)
    }
}

/// Serializable view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub deployment: String,
    pub deployment_id: DeploymentId,
    pub flow: String,
    pub parameters: HashMap<String, Value>,
    pub trigger: RunTrigger,
    pub created_at: DateTime<Utc>,
    pub state: RunState,
    pub attempts: Vec<AttemptRecord>,
    pub outputs: HashMap<String, Value>,
    pub error: Option<RunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunSnapshot {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            deployment: run.deployment.clone(),
            deployment_id: run.deployment_id,
            flow: run.flow.name().to_string(),
            parameters: run.parameters.clone(),
            trigger: run.trigger.clone(),
            created_at: run.created_at,
            state: run.state,
            attempts: run.attempts.clone(),
            outputs: run.outputs.clone(),
            error: run.error.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

impl RunSnapshot {
    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.id,
            state: self.state,
            outputs: (self.state == RunState::Completed).then(|| self.outputs.clone()),
            error: self.error.clone(),
        }
    }
}

/// Answer to a run status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}
