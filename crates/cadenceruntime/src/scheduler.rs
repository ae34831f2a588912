use crate::deployments::DeploymentRegistry;
use cadencecore::{Deployment, OrchestratorError, Run, Value};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a deployment's trigger is within the current tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    Idle,
    Due,
    Enqueued,
}

#[derive(Debug, Clone)]
struct TriggerState {
    expression: String,
    /// Next occurrence is searched strictly after this instant
    watermark: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
    phase: TriggerPhase,
}

impl TriggerState {
    fn new(expression: &str, now: DateTime<Utc>) -> Self {
        Self {
            expression: expression.to_string(),
            watermark: now,
            last_fired: None,
            phase: TriggerPhase::Idle,
        }
    }
}

/// Decides when deployments are due on an externally driven clock
#[derive(Debug, Default)]
pub struct Scheduler {
    states: HashMap<String, TriggerState>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every deployment at `now` and return the runs to enqueue.
    ///
    /// A deployment is due when a cron occurrence falls after its watermark
    /// and at or before `now`. The first tick that sees a deployment only
    /// sets the watermark. Missed occurrences collapse into one run.
    pub fn tick(&mut self, now: DateTime<Utc>, deployments: &[Arc<Deployment>]) -> Vec<Run> {
        for state in self.states.values_mut() {
            if state.phase == TriggerPhase::Enqueued {
                state.phase = TriggerPhase::Idle;
            }
        }
        self.states
            .retain(|name, _| deployments.iter().any(|d| &d.name == name));

        let mut runs = Vec::new();
        for deployment in deployments {
            let schedule = &deployment.trigger.schedule;
            let state = self
                .states
                .entry(deployment.name.clone())
                .or_insert_with(|| TriggerState::new(schedule.expression(), now));

            if state.expression != schedule.expression() {
                tracing::debug!(deployment = %deployment.name, "Schedule changed, resetting trigger");
                *state = TriggerState::new(schedule.expression(), now);
                continue;
            }
            if now < state.watermark {
                continue;
            }
            if !deployment.trigger.enabled {
                state.watermark = now;
                continue;
            }

            let Some(occurrence) = schedule.next_after(&state.watermark) else {
                continue;
            };
            if occurrence > now {
                continue;
            }

            state.phase = TriggerPhase::Due;
            let run = Run::scheduled(deployment, occurrence, now);
            tracing::info!(
                deployment = %deployment.name,
                run_id = %run.id,
                scheduled_for = %occurrence,
                "Deployment is due"
            );
            state.last_fired = Some(now);
            state.watermark = now;
            state.phase = TriggerPhase::Enqueued;
            runs.push(run);
        }

        runs
    }

    /// Create a run immediately, merging `overrides` over the defaults.
    pub async fn manual(
        deployments: &DeploymentRegistry,
        name: &str,
        overrides: HashMap<String, Value>,
    ) -> Result<Run, OrchestratorError> {
        let deployment = deployments.get(name).await?;
        if !deployment.trigger.enabled {
            return Err(OrchestratorError::DeploymentDisabled(name.to_string()));
        }
        Ok(Run::manual(&deployment, overrides))
    }

    pub fn phase(&self, deployment: &str) -> Option<TriggerPhase> {
        self.states.get(deployment).map(|s| s.phase)
    }

    pub fn last_fired(&self, deployment: &str) -> Option<DateTime<Utc>> {
        self.states.get(deployment).and_then(|s| s.last_fired)
    }

    /// Next fire time of a deployment as this scheduler sees it
    pub fn next_fire_time(&self, deployment: &Deployment, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !deployment.trigger.enabled {
            return None;
        }
        let from = self
            .states
            .get(&deployment.name)
            .filter(|s| s.expression == deployment.trigger.schedule.expression())
            .map(|s| s.watermark.max(now))
            .unwrap_or(now);
        deployment.trigger.schedule.next_after(&from)
    }
}
