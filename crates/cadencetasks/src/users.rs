//! Tasks of the user data-processing flow: fetch a batch of users, process
//! each one, then summarize the batch.

use crate::http;
use async_trait::async_trait;
use cadencecore::{Task, TaskContext, TaskError, TaskSignature, Value, ValueKind};
use cadenceruntime::{TaskFactory, TaskMetadata};
use std::collections::HashMap;

pub const USERS_API_VAR: &str = "USERS_API_URL";
const DEFAULT_USERS_API: &str = "https://jsonplaceholder.typicode.com";

#[derive(Default)]
pub struct FetchUsersTask {
    client: Option<reqwest::Client>,
}

#[async_trait]
impl Task for FetchUsersTask {
    fn task_type(&self) -> &str {
        "users.fetch"
    }

    async fn initialize(&mut self) -> Result<(), TaskError> {
        self.client = Some(http::build_client()?);
        Ok(())
    }

    /// Input is the number of users to fetch
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| http::not_initialized(self.task_type()))?;
        let count = user_count(ctx.require_input()?)?;

        let base = ctx.env_or(USERS_API_VAR, DEFAULT_USERS_API);
        let url = format!("{}/users", base.trim_end_matches('/'));
        let body = http::get_json(client, &url).await?;
        let users: Vec<Value> = match body {
            serde_json::Value::Array(users) => users.into_iter().take(count).map(Value::from).collect(),
            _ => {
                return Err(TaskError::ExecutionFailed(
                    "users endpoint did not return a list".to_string(),
                ))
            }
        };

        ctx.events.info(format!("Fetched {} of {} requested users", users.len(), count));
        Ok(Value::Array(users))
    }
}

fn user_count(input: &Value) -> Result<usize, TaskError> {
    input
        .as_i64()
        .filter(|n| *n >= 0)
        .map(|n| n as usize)
        .ok_or_else(|| TaskError::InvalidInput {
            expected: "non-negative integer".to_string(),
            actual: input.to_string(),
        })
}

/// Reduces one user record to the fields the summary needs
pub struct ProcessUserTask;

#[async_trait]
impl Task for ProcessUserTask {
    fn task_type(&self) -> &str {
        "users.process"
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let processed = process_user(ctx.require_input()?)?;
        Ok(processed)
    }
}

fn process_user(user: &Value) -> Result<Value, TaskError> {
    let record = user.as_object().ok_or_else(|| TaskError::InvalidInput {
        expected: ValueKind::Mapping.to_string(),
        actual: user.kind().to_string(),
    })?;
    let field = |name: &str| record.get(name).cloned().unwrap_or_default();

    let email = record.get("email").and_then(Value::as_str).unwrap_or_default();
    let domain = email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .ok_or_else(|| TaskError::ExecutionFailed(format!("user has no valid email: {}", user)))?;
    let city = record
        .get("address")
        .and_then(Value::as_object)
        .and_then(|address| address.get("city"))
        .cloned()
        .unwrap_or_default();

    let mut processed = HashMap::new();
    processed.insert("id".to_string(), field("id"));
    processed.insert("name".to_string(), field("name"));
    processed.insert("email_domain".to_string(), Value::String(domain));
    processed.insert("city".to_string(), city);
    Ok(Value::Object(processed))
}

/// Counts processed users per email domain
pub struct SummarizeUsersTask;

#[async_trait]
impl Task for SummarizeUsersTask {
    fn task_type(&self) -> &str {
        "users.summarize"
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let summary = summarize(ctx.input_array()?);
        ctx.events.info(format!("Summary: {}", summary));
        Ok(summary)
    }
}

fn summarize(users: &[Value]) -> Value {
    let mut domains: HashMap<String, Value> = HashMap::new();
    for domain in users
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|user| user.get("email_domain").and_then(Value::as_str))
    {
        let count = domains.get(domain).and_then(Value::as_f64).unwrap_or(0.0);
        domains.insert(domain.to_string(), Value::Number(count + 1.0));
    }

    let mut summary = HashMap::new();
    summary.insert("total_users".to_string(), Value::Number(users.len() as f64));
    summary.insert("domains".to_string(), Value::Object(domains));
    Value::Object(summary)
}

pub struct FetchUsersTaskFactory;

impl TaskFactory for FetchUsersTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(FetchUsersTask::default()))
    }

    fn task_type(&self) -> &str {
        "users.fetch"
    }

    fn signature(&self) -> TaskSignature {
        TaskSignature::new(ValueKind::Number, ValueKind::Sequence)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Fetch a batch of users from the users API".to_string(),
            category: "http".to_string(),
        }
    }
}

pub struct ProcessUserTaskFactory;

impl TaskFactory for ProcessUserTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(ProcessUserTask))
    }

    fn task_type(&self) -> &str {
        "users.process"
    }

    fn signature(&self) -> TaskSignature {
        TaskSignature::new(ValueKind::Mapping, ValueKind::Mapping)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Extract id, name, email domain and city of a user".to_string(),
            category: "transform".to_string(),
        }
    }
}

pub struct SummarizeUsersTaskFactory;

impl TaskFactory for SummarizeUsersTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(SummarizeUsersTask))
    }

    fn task_type(&self) -> &str {
        "users.summarize"
    }

    fn signature(&self) -> TaskSignature {
        TaskSignature::new(ValueKind::Sequence, ValueKind::Mapping)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Count processed users per email domain".to_string(),
            category: "transform".to_string(),
        }
    }
}
