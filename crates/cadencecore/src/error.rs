use crate::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    #[error("Deployment is disabled: {0}")]
    DeploymentDisabled(String),

    #[error("Run log error: {0}")]
    RunLog(#[from] RunLogError),

    #[error("Infrastructure fault: {0}")]
    Infrastructure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rejections raised synchronously at register, define or deploy time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("Task id already registered with a different signature: {0}")]
    DuplicateTaskId(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    #[error("Cyclic dependency detected at step '{0}'")]
    CyclicDependency(String),

    #[error("Mapped step '{step}' does not read a sequence: {source_desc}")]
    NotASequence { step: String, source_desc: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotFoundError {
    #[error("Deployment not found: {0}")]
    Deployment(String),

    #[error("Run not found: {0}")]
    Run(RunId),

    #[error("Task not found: {0}")]
    Task(String),
}

/// Failure of a single task attempt.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input: expected {expected}, got {actual}")]
    InvalidInput { expected: String, actual: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,

    /// Not a task failure: never retried, crashes the run.
    #[error("Infrastructure fault: {0}")]
    Infrastructure(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Cancelled | TaskError::Infrastructure(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunLogError {
    #[error("Run {0} is not terminal")]
    NotTerminal(RunId),

    #[error("Run {0} already recorded")]
    AlreadyRecorded(RunId),
}

/// Terminal error attached to a failed, crashed or cancelled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub step: Option<String>,
    pub message: String,
}

impl RunError {
    pub fn new(step: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            step: step.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "step '{}': {}", step, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RunError {}
