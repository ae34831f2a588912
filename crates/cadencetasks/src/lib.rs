//! Standard task library
//!
//! Built-in tasks and the stock deployments that use them

mod catalog;
mod debug;
mod github;
mod http;
mod math;
mod securities;
mod users;

pub use catalog::{
    buy_securities_deployment, data_processing_deployment, github_stars_deployment,
    stock_manifest, FLOWS_IMAGE,
};
pub use debug::{DebugTask, DebugTaskFactory};
pub use github::{GithubStarsTask, GithubStarsTaskFactory, GITHUB_API_VAR};
pub use math::{SumTask, SumTaskFactory};
pub use securities::{BuySecuritiesTask, BuySecuritiesTaskFactory, API_URL_VAR};
pub use users::{
    FetchUsersTask, FetchUsersTaskFactory, ProcessUserTask, ProcessUserTaskFactory,
    SummarizeUsersTask, SummarizeUsersTaskFactory, USERS_API_VAR,
};

use cadencecore::ValidationError;
use cadenceruntime::{RegistrationHandle, TaskRegistry, TaskSpec};
use std::sync::Arc;
use std::time::Duration;

/// Register all standard tasks with a registry
pub fn register_all(registry: &mut TaskRegistry) -> Result<Vec<RegistrationHandle>, ValidationError> {
    let specs = vec![
        TaskSpec::new(Arc::new(GithubStarsTaskFactory))
            .with_retries(2, Duration::from_secs(5))
            .with_timeout(Duration::from_secs(10)),
        TaskSpec::new(Arc::new(SumTaskFactory)),
        TaskSpec::new(Arc::new(BuySecuritiesTaskFactory)),
        TaskSpec::new(Arc::new(FetchUsersTaskFactory))
            .with_retries(2, Duration::from_secs(2))
            .with_timeout(Duration::from_secs(10)),
        TaskSpec::new(Arc::new(ProcessUserTaskFactory)),
        TaskSpec::new(Arc::new(SummarizeUsersTaskFactory)),
        TaskSpec::new(Arc::new(DebugTaskFactory)),
    ];

    specs.into_iter().map(|spec| registry.register(spec)).collect()
}

/// A registry holding every standard task
pub fn standard_registry() -> Result<TaskRegistry, ValidationError> {
    let mut registry = TaskRegistry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
