use crate::registry::{TaskRegistry, TaskSpec};
use cadencecore::{
    AttemptOutcome, AttemptRecord, EventBus, EventEmitter, InputRef, Run, RunError, RunEvent,
    RunId, RunState, StepSpec, Task, TaskContext, TaskError, ValidationError, Value,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Executes runs step by step, applying each task's retry policy
pub struct RunExecutor {
    registry: Arc<TaskRegistry>,
    event_bus: Arc<EventBus>,
    max_parallel: usize,
}

/// How one step ended
#[derive(Debug)]
enum StepOutcome {
    Succeeded(Value),
    Failed(String),
    Crashed(String),
    Cancelled,
}

/// How one element's attempt sequence ended
#[derive(Debug)]
enum ElementOutcome {
    Succeeded(Value),
    Failed(TaskError),
    Crashed(String),
    Cancelled,
}

struct ElementResult {
    outcome: ElementOutcome,
    attempts: Vec<AttemptRecord>,
}

impl ElementResult {
    fn without_attempts(outcome: ElementOutcome) -> Self {
        Self {
            outcome,
            attempts: Vec::new(),
        }
    }
}

/// Everything one element needs to run its attempts on its own tokio task
struct ElementJob {
    run_id: RunId,
    step: String,
    element: Option<usize>,
    input: Value,
    params: Arc<HashMap<String, Value>>,
    env: Arc<HashMap<String, String>>,
    emitter: EventEmitter,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Option<Duration>,
}

impl RunExecutor {
    pub fn new(registry: Arc<TaskRegistry>, event_bus: Arc<EventBus>, max_parallel: usize) -> Self {
        Self {
            registry,
            event_bus,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Execute a run to a terminal state.
    ///
    /// Steps run in declaration order and the first failed step ends the
    /// run. `cancellation` reaches every in-flight attempt and retry delay.
    pub async fn drain_and_execute(&self, mut run: Run, cancellation: CancellationToken) -> Run {
        if run.is_terminal() {
            tracing::warn!(run_id = %run.id, state = %run.state, "Run is already terminal");
            return run;
        }

        if cancellation.is_cancelled() {
            run.finish(
                RunState::Cancelled,
                Some(RunError::new(None, "cancelled before start")),
            );
            self.emit_finished(&run);
            return run;
        }

        run.start();
        tracing::info!(run_id = %run.id, deployment = %run.deployment, "Starting run");
        self.event_bus.emit(RunEvent::RunStarted {
            run_id: run.id,
            deployment: run.deployment.clone(),
            timestamp: Utc::now(),
        });

        let flow = run.flow.clone();
        let params = Arc::new(run.parameters.clone());
        let env = Arc::new(run.env.clone());

        for step in flow.steps() {
            let started = Instant::now();
            let outcome = self
                .execute_step(&mut run, step, &params, &env, &cancellation)
                .await;

            match outcome {
                StepOutcome::Succeeded(value) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(run_id = %run.id, step = %step.name, duration_ms, "Step completed");
                    self.event_bus.emit(RunEvent::StepCompleted {
                        run_id: run.id,
                        step: step.name.clone(),
                        duration_ms,
                        timestamp: Utc::now(),
                    });
                    run.outputs.insert(step.name.clone(), value);
                }
                StepOutcome::Failed(message) => {
                    tracing::error!(run_id = %run.id, step = %step.name, "Step failed: {}", message);
                    run.finish(RunState::Failed, Some(RunError::new(Some(&step.name), message)));
                    break;
                }
                StepOutcome::Crashed(message) => {
                    tracing::error!(run_id = %run.id, step = %step.name, "Infrastructure fault: {}", message);
                    run.finish(RunState::Crashed, Some(RunError::new(Some(&step.name), message)));
                    break;
                }
                StepOutcome::Cancelled => {
                    tracing::info!(run_id = %run.id, step = %step.name, "Run cancelled");
                    run.finish(
                        RunState::Cancelled,
                        Some(RunError::new(Some(&step.name), "cancelled")),
                    );
                    break;
                }
            }
        }

        if !run.is_terminal() {
            run.finish(RunState::Completed, None);
        }
        self.emit_finished(&run);
        run
    }

    fn emit_finished(&self, run: &Run) {
        let duration_ms = run.duration_ms();
        match run.state {
            RunState::Completed => {
                tracing::info!(run_id = %run.id, deployment = %run.deployment, duration_ms, "Run completed")
            }
            state => tracing::warn!(
                run_id = %run.id,
                deployment = %run.deployment,
                duration_ms,
                %state,
                error = ?run.error,
                "Run did not complete"
            ),
        }
        self.event_bus.emit(RunEvent::RunFinished {
            run_id: run.id,
            deployment: run.deployment.clone(),
            state: run.state,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    async fn execute_step(
        &self,
        run: &mut Run,
        step: &StepSpec,
        params: &Arc<HashMap<String, Value>>,
        env: &Arc<HashMap<String, String>>,
        cancellation: &CancellationToken,
    ) -> StepOutcome {
        let spec = match self.registry.resolve(&step.task) {
            Ok(spec) => spec,
            Err(e) => return StepOutcome::Crashed(e.to_string()),
        };

        let input = match resolve_input(step, &run.parameters, &run.outputs) {
            Ok(input) => input,
            Err(message) => return StepOutcome::Failed(message),
        };

        let elements: Vec<(Option<usize>, Value)> = if step.is_mapped() {
            match input {
                Value::Array(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(idx, item)| (Some(idx), item))
                    .collect(),
                other => {
                    let err = ValidationError::NotASequence {
                        step: step.name.clone(),
                        source_desc: format!("input is {}", other.kind()),
                    };
                    return StepOutcome::Failed(err.to_string());
                }
            }
        } else {
            vec![(None, input)]
        };

        self.event_bus.emit(RunEvent::StepStarted {
            run_id: run.id,
            step: step.name.clone(),
            task: step.task.clone(),
            elements: step.is_mapped().then_some(elements.len()),
            timestamp: Utc::now(),
        });
        tracing::debug!(
            run_id = %run.id,
            step = %step.name,
            task = %step.task,
            elements = elements.len(),
            "Starting step"
        );

        // Scoped acquisition: one instance per step, always shut down
        let mut instance = match spec.factory.create() {
            Ok(instance) => instance,
            Err(e) => {
                return StepOutcome::Crashed(format!("failed to create task '{}': {}", spec.id, e))
            }
        };
        if let Err(e) = instance.initialize().await {
            return StepOutcome::Crashed(format!("failed to initialize task '{}': {}", spec.id, e));
        }
        let task: Arc<dyn Task> = Arc::from(instance);

        let results = self
            .run_elements(run.id, step, &spec, task.clone(), elements, params, env, cancellation)
            .await;

        if let Err(e) = task.shutdown().await {
            tracing::warn!(run_id = %run.id, step = %step.name, "Task shutdown failed: {}", e);
        }

        let mut values = Vec::with_capacity(results.len());
        let mut crashed = None;
        let mut cancelled = false;
        let mut failures = Vec::new();
        for (position, result) in results.into_iter().enumerate() {
            run.attempts.extend(result.attempts);
            match result.outcome {
                ElementOutcome::Succeeded(value) => values.push(value),
                ElementOutcome::Failed(e) => failures.push((position, e)),
                ElementOutcome::Crashed(message) => {
                    crashed.get_or_insert(message);
                }
                ElementOutcome::Cancelled => cancelled = true,
            }
        }

        if let Some(message) = crashed {
            return StepOutcome::Crashed(message);
        }
        if cancelled {
            return StepOutcome::Cancelled;
        }
        if let Some((position, error)) = failures.first() {
            let attempts = spec.max_attempts();
            let message = if step.is_mapped() {
                format!(
                    "{} of {} elements exhausted {} attempt(s); element {}: {}",
                    failures.len(),
                    values.len() + failures.len(),
                    attempts,
                    position,
                    error
                )
            } else {
                format!("exhausted {} attempt(s): {}", attempts, error)
            };
            return StepOutcome::Failed(message);
        }

        if step.is_mapped() {
            StepOutcome::Succeeded(Value::Array(values))
        } else {
            StepOutcome::Succeeded(values.pop().unwrap_or_default())
        }
    }

    /// Run every element to completion, at most `max_parallel` at a time.
    /// Results come back in input order.
    #[allow(clippy::too_many_arguments)]
    async fn run_elements(
        &self,
        run_id: RunId,
        step: &StepSpec,
        spec: &TaskSpec,
        task: Arc<dyn Task>,
        elements: Vec<(Option<usize>, Value)>,
        params: &Arc<HashMap<String, Value>>,
        env: &Arc<HashMap<String, String>>,
        cancellation: &CancellationToken,
    ) -> Vec<ElementResult> {
        let total = elements.len();
        let mut results: Vec<Option<ElementResult>> = (0..total).map(|_| None).collect();
        let mut pending = elements.into_iter().enumerate();
        let mut running = FuturesUnordered::new();
        let step_emitter = self.event_bus.create_emitter(run_id, step.name.clone());

        loop {
            while running.len() < self.max_parallel {
                let Some((position, (element, input))) = pending.next() else {
                    break;
                };
                if cancellation.is_cancelled() {
                    results[position] = Some(ElementResult::without_attempts(ElementOutcome::Cancelled));
                    continue;
                }

                let job = ElementJob {
                    run_id,
                    step: step.name.clone(),
                    element,
                    input,
                    params: params.clone(),
                    env: env.clone(),
                    emitter: match element {
                        Some(idx) => step_emitter.for_element(idx),
                        None => step_emitter.clone(),
                    },
                    max_retries: spec.max_retries,
                    retry_delay: spec.retry_delay,
                    timeout: spec.timeout,
                };
                let handle = tokio::spawn(run_attempts(
                    task.clone(),
                    job,
                    self.event_bus.clone(),
                    cancellation.clone(),
                ));
                running.push(async move { (position, handle.await) });
            }

            match running.next().await {
                Some((position, Ok(result))) => results[position] = Some(result),
                Some((position, Err(join_error))) => {
                    results[position] = Some(ElementResult::without_attempts(
                        ElementOutcome::Crashed(format!("element task aborted: {}", join_error)),
                    ));
                }
                None => break,
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| ElementResult::without_attempts(ElementOutcome::Cancelled)))
            .collect()
    }
}

fn resolve_input(
    step: &StepSpec,
    params: &HashMap<String, Value>,
    outputs: &HashMap<String, Value>,
) -> Result<Value, String> {
    match &step.input {
        None => Ok(Value::Null),
        Some(InputRef::Param(key)) => match params.get(key) {
            Some(value) => Ok(value.clone()),
            None if step.is_mapped() => Err(format!("parameter '{}' is missing", key)),
            None => Ok(Value::Null),
        },
        Some(InputRef::Step(name)) => outputs
            .get(name)
            .cloned()
            .ok_or_else(|| format!("output of step '{}' is not available", name)),
        Some(InputRef::Literal(value)) => Ok(value.clone()),
    }
}

/// Attempt one element until it succeeds, exhausts its retries, crashes
/// or is cancelled. Retries wait only on this element.
async fn run_attempts(
    task: Arc<dyn Task>,
    job: ElementJob,
    event_bus: Arc<EventBus>,
    cancellation: CancellationToken,
) -> ElementResult {
    let max_attempts = job.max_retries.saturating_add(1);
    let mut attempts = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let ctx = TaskContext {
            run_id: job.run_id,
            step: job.step.clone(),
            element: job.element,
            attempt,
            input: job.input.clone(),
            params: job.params.clone(),
            env: job.env.clone(),
            events: job.emitter.clone(),
            cancellation: cancellation.child_token(),
        };

        let started_at = Utc::now();
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(TaskError::Cancelled),
            result = invoke(task.as_ref(), ctx, job.timeout) => result,
        };
        let mut record = |outcome| {
            attempts.push(AttemptRecord {
                step: job.step.clone(),
                element: job.element,
                attempt,
                outcome,
                started_at,
                finished_at: Utc::now(),
            })
        };

        let error = match result {
            Ok(value) => {
                record(AttemptOutcome::Succeeded);
                return ElementResult {
                    outcome: ElementOutcome::Succeeded(value),
                    attempts,
                };
            }
            Err(TaskError::Cancelled) => {
                record(AttemptOutcome::Cancelled);
                return ElementResult {
                    outcome: ElementOutcome::Cancelled,
                    attempts,
                };
            }
            Err(TaskError::Infrastructure(message)) => {
                record(AttemptOutcome::Crashed(message.clone()));
                return ElementResult {
                    outcome: ElementOutcome::Crashed(message),
                    attempts,
                };
            }
            Err(error) => {
                record(AttemptOutcome::Failed(error.to_string()));
                error
            }
        };

        let will_retry = attempt < max_attempts;
        tracing::warn!(
            run_id = %job.run_id,
            step = %job.step,
            element = ?job.element,
            attempt,
            max_attempts,
            will_retry,
            "Attempt failed: {}",
            error
        );
        event_bus.emit(RunEvent::AttemptFailed {
            run_id: job.run_id,
            step: job.step.clone(),
            element: job.element,
            attempt,
            error: error.to_string(),
            will_retry,
            timestamp: Utc::now(),
        });

        if !will_retry {
            return ElementResult {
                outcome: ElementOutcome::Failed(error),
                attempts,
            };
        }

        if !job.retry_delay.is_zero() {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    return ElementResult {
                        outcome: ElementOutcome::Cancelled,
                        attempts,
                    };
                }
                _ = tokio::time::sleep(job.retry_delay) => {}
            }
        }
    }
}

/// One attempt, with the optional timeout applied and panics turned into
/// infrastructure faults.
async fn invoke(task: &dyn Task, ctx: TaskContext, timeout: Option<Duration>) -> Result<Value, TaskError> {
    let attempt = AssertUnwindSafe(task.run(ctx)).catch_unwind();
    let caught = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(caught) => caught,
            Err(_) => {
                return Err(TaskError::Timeout {
                    millis: limit.as_millis() as u64,
                })
            }
        },
        None => attempt.await,
    };

    caught.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(TaskError::Infrastructure(format!("task panicked: {}", message)))
    })
}
