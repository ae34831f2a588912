use crate::{events::EventEmitter, RunId, TaskError, Value, ValueKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type TaskId = String;

/// A unit of work invoked by a flow step
#[async_trait]
pub trait Task: Send + Sync {
    /// Identifier of the task kind (e.g. "github.stars")
    fn task_type(&self) -> &str;

    /// Run one attempt. Returning an error counts as a failed attempt
    /// unless the error is `Infrastructure` or `Cancelled`.
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError>;

    /// Acquire scoped resources before the first attempt of a step.
    async fn initialize(&mut self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Release scoped resources. Called once per step on every exit path.
    async fn shutdown(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Declared input and output kinds of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskSignature {
    pub input: ValueKind,
    pub output: ValueKind,
}

impl TaskSignature {
    pub fn new(input: ValueKind, output: ValueKind) -> Self {
        Self { input, output }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        self.input == ValueKind::Any || self.input == value.kind()
    }
}

impl Default for TaskSignature {
    fn default() -> Self {
        Self::new(ValueKind::Any, ValueKind::Any)
    }
}

/// Execution context passed to each attempt
#[derive(Clone)]
pub struct TaskContext {
    pub run_id: RunId,

    /// Step being executed
    pub step: String,

    /// Element index within a mapped step
    pub element: Option<usize>,

    /// 1-based attempt number
    pub attempt: u32,

    pub input: Value,

    /// Effective run parameters, unknown keys included
    pub params: Arc<HashMap<String, Value>>,

    /// Environment variables from the deployment's execution environment
    pub env: Arc<HashMap<String, String>>,

    pub events: EventEmitter,

    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(run_id: RunId, step: impl Into<String>, events: EventEmitter) -> Self {
        Self {
            run_id,
            step: step.into(),
            element: None,
            attempt: 1,
            input: Value::Null,
            params: Arc::new(HashMap::new()),
            env: Arc::new(HashMap::new()),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = input.into();
        self
    }

    /// Input or `MissingInput` when the step received nothing
    pub fn require_input(&self) -> Result<&Value, TaskError> {
        if self.input.is_null() {
            return Err(TaskError::MissingInput(self.step.clone()));
        }
        Ok(&self.input)
    }

    pub fn input_str(&self) -> Result<&str, TaskError> {
        let input = self.require_input()?;
        input.as_str().ok_or_else(|| TaskError::InvalidInput {
            expected: ValueKind::String.to_string(),
            actual: input.kind().to_string(),
        })
    }

    pub fn input_array(&self) -> Result<&[Value], TaskError> {
        let input = self.require_input()?;
        input.as_array().ok_or_else(|| TaskError::InvalidInput {
            expected: ValueKind::Sequence.to_string(),
            actual: input.kind().to_string(),
        })
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Environment variable with a fallback
    pub fn env_or(&self, name: &str, default: &str) -> String {
        self.env.get(name).cloned().unwrap_or_else(|| default.to_string())
    }
}
