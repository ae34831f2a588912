//! Core abstractions for the orchestration engine
//!
//! This crate holds the data model shared by the runtime, the task library
//! and the binaries: values, tasks, flow graphs, cron schedules,
//! deployments, runs and run events. It spawns nothing.

mod deployment;
mod error;
pub mod events;
mod flow;
mod run;
mod schedule;
mod task;
mod value;

pub use deployment::{
    Deployment, DeploymentId, DeploymentMetadata, DeploymentSpec, ExecutionEnvironment,
    PullPolicy, Trigger, TriggerSpec,
};
pub use error::{
    NotFoundError, OrchestratorError, RunError, RunLogError, TaskError, ValidationError,
};
pub use events::*;
pub use flow::{FlowDefinition, FlowGraph, InputRef, StepKind, StepSpec, TaskCatalog};
pub use run::{
    AttemptOutcome, AttemptRecord, Run, RunId, RunSnapshot, RunState, RunStatus, RunTrigger,
};
pub use schedule::CronSchedule;
pub use task::{Task, TaskContext, TaskId, TaskSignature};
pub use value::{Value, ValueKind};

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
