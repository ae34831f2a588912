use cadencecore::{
    NotFoundError, Task, TaskCatalog, TaskError, TaskId, TaskSignature, ValidationError,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Factory trait for creating task instances
pub trait TaskFactory: Send + Sync {
    /// Create a fresh instance; one instance serves all attempts of a step
    fn create(&self) -> Result<Box<dyn Task>, TaskError>;

    /// Get task type identifier
    fn task_type(&self) -> &str;

    fn signature(&self) -> TaskSignature {
        TaskSignature::default()
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::default()
    }
}

/// Metadata about a task type
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub description: String,
    pub category: String,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// A registered unit of work plus its retry policy
#[derive(Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub factory: Arc<dyn TaskFactory>,
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
    /// Per-attempt limit; a timeout counts as a failed attempt
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    /// Spec registered under the factory's task type, with no retries
    pub fn new(factory: Arc<dyn TaskFactory>) -> Self {
        Self {
            id: factory.task_type().to_string(),
            factory,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            timeout: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signature(&self) -> TaskSignature {
        self.factory.signature()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("task_type", &self.factory.task_type())
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Opaque proof of registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    id: TaskId,
    signature: TaskSignature,
}

impl RegistrationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signature(&self) -> TaskSignature {
        self.signature
    }
}

/// Registry of available tasks
pub struct TaskRegistry {
    tasks: HashMap<TaskId, TaskSpec>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task. Re-registering an id is allowed only with the same
    /// signature, in which case the callable and policy are replaced.
    pub fn register(&mut self, spec: TaskSpec) -> Result<RegistrationHandle, ValidationError> {
        let signature = spec.signature();
        if let Some(existing) = self.tasks.get(&spec.id) {
            if existing.signature() != signature {
                return Err(ValidationError::DuplicateTaskId(spec.id));
            }
            tracing::debug!(task = %spec.id, "Replacing task registration");
        }

        tracing::info!(
            task = %spec.id,
            max_retries = spec.max_retries,
            retry_delay_ms = spec.retry_delay.as_millis() as u64,
            "Registering task"
        );
        let handle = RegistrationHandle {
            id: spec.id.clone(),
            signature,
        };
        self.tasks.insert(spec.id.clone(), spec);
        Ok(handle)
    }

    pub fn resolve(&self, id: &str) -> Result<TaskSpec, NotFoundError> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| NotFoundError::Task(id.to_string()))
    }

    /// Registered task ids, sorted
    pub fn list_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_metadata(&self, id: &str) -> Option<TaskMetadata> {
        self.tasks.get(id).map(|spec| spec.factory.metadata())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCatalog for TaskRegistry {
    fn signature(&self, task: &str) -> Option<TaskSignature> {
        self.tasks.get(task).map(TaskSpec::signature)
    }
}
