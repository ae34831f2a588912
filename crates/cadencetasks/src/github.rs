use crate::http;
use async_trait::async_trait;
use cadencecore::{Task, TaskContext, TaskError, TaskSignature, Value, ValueKind};
use cadenceruntime::{TaskFactory, TaskMetadata};

pub const GITHUB_API_VAR: &str = "GITHUB_API_URL";
const DEFAULT_GITHUB_API: &str = "https://api.github.com";

/// Fetches the stargazer count of one `owner/name` repository
#[derive(Default)]
pub struct GithubStarsTask {
    client: Option<reqwest::Client>,
}

#[async_trait]
impl Task for GithubStarsTask {
    fn task_type(&self) -> &str {
        "github.stars"
    }

    async fn initialize(&mut self) -> Result<(), TaskError> {
        self.client = Some(http::build_client()?);
        Ok(())
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| http::not_initialized(self.task_type()))?;
        let repo = ctx.input_str()?;
        if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(TaskError::InvalidInput {
                expected: "owner/name".to_string(),
                actual: repo.to_string(),
            });
        }

        let base = ctx.env_or(GITHUB_API_VAR, DEFAULT_GITHUB_API);
        let url = format!("{}/repos/{}", base.trim_end_matches('/'), repo);
        let body = http::get_json(client, &url).await?;
        let stars = stargazers(&body)?;

        ctx.events.info(format!("{} has {} stars", repo, stars));
        Ok(Value::Number(stars as f64))
    }
}

fn stargazers(body: &serde_json::Value) -> Result<u64, TaskError> {
    body.get("stargazers_count")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| {
            TaskError::ExecutionFailed("response has no stargazers_count".to_string())
        })
}

pub struct GithubStarsTaskFactory;

impl TaskFactory for GithubStarsTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(GithubStarsTask::default()))
    }

    fn task_type(&self) -> &str {
        "github.stars"
    }

    fn signature(&self) -> TaskSignature {
        TaskSignature::new(ValueKind::String, ValueKind::Number)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Get the number of stars of a GitHub repository".to_string(),
            category: "http".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadencecore::EventBus;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn reads_stargazers_count() {
        let body = json!({ "full_name": "PrefectHQ/prefect", "stargazers_count": 17000 });
        assert_eq!(stargazers(&body).unwrap(), 17000);
        assert!(stargazers(&json!({ "message": "Not Found" })).is_err());
    }

    #[tokio::test]
    async fn rejects_malformed_repository() {
        let mut task = GithubStarsTask::default();
        task.initialize().await.unwrap();

        let bus = EventBus::new(16);
        let ctx = TaskContext::new(Uuid::new_v4(), "get_stars", bus.create_emitter(Uuid::new_v4(), "get_stars"))
            .with_input("not-a-repo");
        assert!(matches!(task.run(ctx).await, Err(TaskError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn requires_initialize() {
        let task = GithubStarsTask::default();
        let bus = EventBus::new(16);
        let ctx = TaskContext::new(Uuid::new_v4(), "get_stars", bus.create_emitter(Uuid::new_v4(), "get_stars"))
            .with_input("apache/airflow");
        assert!(matches!(task.run(ctx).await, Err(TaskError::Infrastructure(_))));
    }
}
