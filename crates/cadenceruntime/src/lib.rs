//! Orchestration runtime
//!
//! This crate provides the task and deployment registries, the cron
//! scheduler, the run executor and the orchestrator that wires them to a
//! run queue and a pool of workers.

mod config;
mod deployments;
mod executor;
mod registry;
mod run_log;
mod run_store;
mod runtime;
mod scheduler;
mod worker;

pub use config::{Manifest, RuntimeConfig};
pub use deployments::DeploymentRegistry;
pub use executor::RunExecutor;
pub use registry::{RegistrationHandle, TaskFactory, TaskMetadata, TaskRegistry, TaskSpec};
pub use run_log::{MemoryRunLog, RunLog};
pub use run_store::RunStore;
pub use runtime::Orchestrator;
pub use scheduler::{Scheduler, TriggerPhase};
