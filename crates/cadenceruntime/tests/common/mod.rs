// Shared helpers for the runtime integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use cadencecore::{
    Deployment, DeploymentMetadata, ExecutionEnvironment, FlowDefinition, FlowGraph, Task,
    TaskContext, TaskError, TaskSignature, TriggerSpec, Value,
};
use cadenceruntime::{TaskFactory, TaskRegistry, TaskSpec};
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type Handler = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, Result<Value, TaskError>> + Send + Sync>;

/// Counts instance lifecycle calls made by the executor
#[derive(Default)]
pub struct Lifecycle {
    pub created: AtomicUsize,
    pub initialized: AtomicUsize,
    pub shut_down: AtomicUsize,
    pub runs: AtomicUsize,
}

impl Lifecycle {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

struct FnTask {
    task_type: String,
    handler: Handler,
    lifecycle: Arc<Lifecycle>,
    fail_initialize: bool,
}

#[async_trait]
impl Task for FnTask {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        self.lifecycle.runs.fetch_add(1, Ordering::SeqCst);
        (self.handler)(ctx).await
    }

    async fn initialize(&mut self) -> Result<(), TaskError> {
        self.lifecycle.initialized.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(TaskError::Infrastructure("resource unavailable".to_string()));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TaskError> {
        self.lifecycle.shut_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for tasks whose behavior is a closure
pub struct FnFactory {
    task_type: String,
    signature: TaskSignature,
    handler: Handler,
    pub lifecycle: Arc<Lifecycle>,
    fail_initialize: bool,
}

impl FnFactory {
    pub fn new<F, Fut>(task_type: &str, handler: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            task_type: task_type.to_string(),
            signature: TaskSignature::default(),
            handler: Arc::new(move |ctx| -> BoxFuture<'static, Result<Value, TaskError>> {
                Box::pin(handler(ctx))
            }),
            lifecycle: Arc::new(Lifecycle::default()),
            fail_initialize: false,
        }
    }

    pub fn with_signature(mut self, signature: TaskSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }
}

impl TaskFactory for FnFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        self.lifecycle.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FnTask {
            task_type: self.task_type.clone(),
            handler: self.handler.clone(),
            lifecycle: self.lifecycle.clone(),
            fail_initialize: self.fail_initialize,
        }))
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn signature(&self) -> TaskSignature {
        self.signature
    }
}

/// Register a factory and hand back its lifecycle counters
pub fn register(
    registry: &mut TaskRegistry,
    factory: FnFactory,
    retries: u32,
) -> Arc<Lifecycle> {
    let lifecycle = factory.lifecycle.clone();
    let spec = TaskSpec::new(Arc::new(factory)).with_retries(retries, Duration::from_millis(5));
    registry.register(spec).expect("registration should succeed");
    lifecycle
}

pub fn echo() -> FnFactory {
    FnFactory::new("echo", |ctx| async move { Ok(ctx.input) })
}

pub fn double() -> FnFactory {
    FnFactory::new("double", |ctx| async move {
        let n = ctx.require_input()?.as_f64().ok_or_else(|| TaskError::InvalidInput {
            expected: "number".to_string(),
            actual: ctx.input.kind().to_string(),
        })?;
        Ok(Value::Number(n * 2.0))
    })
}

pub fn always_fails() -> FnFactory {
    FnFactory::new("fails", |_ctx| async move {
        Err(TaskError::ExecutionFailed("upstream unavailable".to_string()))
    })
}

/// Sleeps for the number of milliseconds given as input, then echoes it
pub fn sleepy() -> FnFactory {
    FnFactory::new("sleepy", |ctx| async move {
        let millis = ctx.input.as_f64().unwrap_or(0.0) as u64;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(ctx.input)
    })
}

/// Waits until the attempt is cancelled
pub fn blocks() -> FnFactory {
    FnFactory::new("blocks", |ctx| async move {
        ctx.cancellation.cancelled().await;
        Err(TaskError::Cancelled)
    })
}

pub fn panics() -> FnFactory {
    FnFactory::new("panics", |_ctx| async move {
        if true {
            panic!("boom");
        }
        Ok(Value::Null)
    })
}

/// Deployment bound to `flow`, validated against `registry`
pub fn deployment(
    registry: &TaskRegistry,
    name: &str,
    flow: FlowDefinition,
    parameters: HashMap<String, Value>,
) -> Arc<Deployment> {
    let flow = FlowGraph::define(flow, registry).expect("flow should validate");
    let now = Utc::now();
    Arc::new(Deployment {
        id: Uuid::new_v4(),
        name: name.to_string(),
        flow: Arc::new(flow),
        trigger: TriggerSpec::cron("0 0 * * *").parse().expect("valid cron"),
        parameters,
        environment: ExecutionEnvironment::image("cadence-flows:latest"),
        metadata: DeploymentMetadata::default(),
        created_at: now,
        updated_at: now,
    })
}

pub fn params(entries: &[(&str, Value)]) -> HashMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
