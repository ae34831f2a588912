use cadencecore::{
    Deployment, DeploymentMetadata, ExecutionEnvironment, FlowGraph, NotFoundError, TriggerSpec,
    ValidationError, Value,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Named deployments watched by the scheduler
#[derive(Default)]
pub struct DeploymentRegistry {
    deployments: RwLock<HashMap<String, Arc<Deployment>>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a deployment by name. Runs created from a
    /// replaced deployment keep their own snapshot.
    pub async fn deploy(
        &self,
        name: &str,
        flow: Arc<FlowGraph>,
        trigger: TriggerSpec,
        parameters: HashMap<String, Value>,
        environment: ExecutionEnvironment,
        metadata: DeploymentMetadata,
    ) -> Result<Arc<Deployment>, ValidationError> {
        if name.trim().is_empty() {
            return Err(ValidationError::InvalidDeployment("name is empty".to_string()));
        }
        let trigger = trigger.parse()?;
        environment.validate()?;

        let now = Utc::now();
        let mut deployments = self.deployments.write().await;
        let previous = deployments.get(name);
        let deployment = Arc::new(Deployment {
            id: previous.map(|d| d.id).unwrap_or_else(Uuid::new_v4),
            name: name.to_string(),
            flow,
            trigger,
            parameters,
            environment,
            metadata,
            created_at: previous.map(|d| d.created_at).unwrap_or(now),
            updated_at: now,
        });

        match previous {
            Some(previous) if previous.same_binding(&deployment) => {
                tracing::debug!(deployment = %name, "Redeployed without changes")
            }
            Some(_) => tracing::info!(
                deployment = %name,
                cron = %deployment.trigger.schedule,
                "Replacing deployment"
            ),
            None => tracing::info!(
                deployment = %name,
                flow = %deployment.flow.name(),
                cron = %deployment.trigger.schedule,
                "Creating deployment"
            ),
        }

        deployments.insert(name.to_string(), deployment.clone());
        Ok(deployment)
    }

    pub async fn remove(&self, name: &str) -> Result<Arc<Deployment>, NotFoundError> {
        let removed = self
            .deployments
            .write()
            .await
            .remove(name)
            .ok_or_else(|| NotFoundError::Deployment(name.to_string()))?;
        tracing::info!(deployment = %name, "Removed deployment");
        Ok(removed)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Deployment>, NotFoundError> {
        self.deployments
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| NotFoundError::Deployment(name.to_string()))
    }

    /// All deployments, sorted by name
    pub async fn list(&self) -> Vec<Arc<Deployment>> {
        let mut deployments: Vec<_> = self.deployments.read().await.values().cloned().collect();
        deployments.sort_by(|a, b| a.name.cmp(&b.name));
        deployments
    }
}
