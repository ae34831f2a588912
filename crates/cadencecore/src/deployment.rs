use crate::{CronSchedule, FlowDefinition, FlowGraph, ValidationError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub type DeploymentId = Uuid;

/// Trigger as requested, before the schedule is parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub cron: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TriggerSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron: expression.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn parse(&self) -> Result<Trigger, ValidationError> {
        Ok(Trigger {
            schedule: CronSchedule::parse(&self.cron)?,
            enabled: self.enabled,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub schedule: CronSchedule,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Where a deployment's runs are meant to execute
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    pub image: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default)]
    pub network_refs: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl ExecutionEnvironment {
    pub fn image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network_refs.push(network.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let image = self.image.trim();
        if image.is_empty() {
            return Err(ValidationError::InvalidEnvironment("image is empty".to_string()));
        }
        if image.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidEnvironment(format!(
                "image '{}' contains whitespace",
                self.image
            )));
        }
        if self.network_refs.iter().any(|n| n.trim().is_empty()) {
            return Err(ValidationError::InvalidEnvironment(
                "network reference is empty".to_string(),
            ));
        }
        if let Some(key) = self
            .env_vars
            .keys()
            .find(|k| k.trim().is_empty() || k.contains('='))
        {
            return Err(ValidationError::InvalidEnvironment(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Named, schedulable binding of a flow to a trigger and parameters
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub flow: Arc<FlowGraph>,
    pub trigger: Trigger,
    pub parameters: HashMap<String, Value>,
    pub environment: ExecutionEnvironment,
    pub metadata: DeploymentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Defaults with overrides applied key by key
    pub fn effective_parameters(
        &self,
        overrides: HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let mut params = self.parameters.clone();
        params.extend(overrides);
        params
    }

    /// Whether redeploying `other` would change behavior
    pub fn same_binding(&self, other: &Deployment) -> bool {
        self.flow == other.flow
            && self.trigger == other.trigger
            && self.parameters == other.parameters
            && self.environment == other.environment
    }
}

/// Deployment as written in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub flow: FlowDefinition,
    pub schedule: TriggerSpec,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    pub environment: ExecutionEnvironment,
}

impl DeploymentSpec {
    pub fn metadata(&self) -> DeploymentMetadata {
        DeploymentMetadata {
            description: self.description.clone(),
            tags: self.tags.clone(),
        }
    }
}
