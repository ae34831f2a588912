use crate::securities::API_URL_VAR;
use cadencecore::{
    DeploymentSpec, ExecutionEnvironment, FlowDefinition, PullPolicy, StepSpec, TriggerSpec, Value,
};
use cadenceruntime::{Manifest, RuntimeConfig};
use std::collections::HashMap;

pub const FLOWS_IMAGE: &str = "cadence-flows:latest";

/// Star counts of a few orchestration projects, every 6 hours
pub fn github_stars_deployment() -> DeploymentSpec {
    let repos: Vec<&str> = vec![
        "PrefectHQ/prefect",
        "apache/airflow",
        "dagster-io/dagster",
        "spotify/luigi",
    ];

    DeploymentSpec {
        name: "github-stars-deployment".to_string(),
        description: Some("Monitor GitHub repository stars every 6 hours".to_string()),
        tags: tags(&["github", "monitoring", "scheduled"]),
        flow: FlowDefinition::new("github-stars-flow")
            .with_description("Total stars of a set of GitHub repositories")
            .step(StepSpec::mapped("get_stars", "github.stars").from_param("repos"))
            .step(StepSpec::scalar("calculate_total_stars", "math.sum").from_step("get_stars")),
        schedule: TriggerSpec::cron("0 */6 * * *"),
        parameters: HashMap::from([("repos".to_string(), Value::from(repos))]),
        environment: ExecutionEnvironment::image(FLOWS_IMAGE)
            .with_pull_policy(PullPolicy::IfNotPresent),
    }
}

/// Fetch, process and summarize users, every 4 hours
pub fn data_processing_deployment() -> DeploymentSpec {
    DeploymentSpec {
        name: "data-processing-deployment".to_string(),
        description: Some("Process user data every 4 hours".to_string()),
        tags: tags(&["data-processing", "api", "scheduled"]),
        flow: FlowDefinition::new("data-processing-flow")
            .step(StepSpec::scalar("fetch_users", "users.fetch").from_param("user_count"))
            .step(StepSpec::mapped("process_user", "users.process").from_step("fetch_users"))
            .step(StepSpec::scalar("summarize", "users.summarize").from_step("process_user")),
        schedule: TriggerSpec::cron("0 */4 * * *"),
        parameters: HashMap::from([("user_count".to_string(), Value::from(10i64))]),
        environment: ExecutionEnvironment::image(FLOWS_IMAGE)
            .with_pull_policy(PullPolicy::IfNotPresent),
    }
}

pub fn buy_securities_deployment() -> DeploymentSpec {
    DeploymentSpec {
        name: "buy-securities-deployment".to_string(),
        description: None,
        tags: tags(&["production", "trading"]),
        flow: FlowDefinition::new("buy-securities")
            .with_version("1.0.0")
            .with_description("Flow to handle buying of securities")
            .step(StepSpec::scalar("buy", "securities.buy")),
        schedule: TriggerSpec::cron("* * * * *"),
        parameters: HashMap::new(),
        environment: ExecutionEnvironment::image(FLOWS_IMAGE)
            .with_pull_policy(PullPolicy::Never)
            .with_network("cadence_network")
            .with_env(API_URL_VAR, "http://cadence-server:8080/api"),
    }
}

/// Manifest written by `cadence init`
pub fn stock_manifest() -> Manifest {
    Manifest {
        runtime: RuntimeConfig::default(),
        deployments: vec![
            github_stars_deployment(),
            data_processing_deployment(),
            buy_securities_deployment(),
        ],
    }
}

fn tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
}
