mod common;

use cadencecore::{
    AttemptOutcome, EventBus, FlowDefinition, InputRef, Run, RunEvent, RunState, StepSpec,
    TaskError, Value,
};
use cadenceruntime::{RunExecutor, TaskRegistry, TaskSpec};
use common::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn executor(registry: TaskRegistry, max_parallel: usize) -> (RunExecutor, Arc<EventBus>) {
    let bus = Arc::new(EventBus::new(1000));
    (RunExecutor::new(Arc::new(registry), bus.clone(), max_parallel), bus)
}

fn literal(value: impl Into<Value>) -> InputRef {
    InputRef::Literal(value.into())
}

fn numbers(values: &[i64]) -> Value {
    Value::from(values.to_vec())
}

#[tokio::test]
async fn test_scalar_steps_chain_outputs() {
    let mut registry = TaskRegistry::new();
    register(&mut registry, echo(), 0);
    register(&mut registry, double(), 0);
    let deployment = deployment(
        &registry,
        "chain",
        FlowDefinition::new("chain")
            .step(StepSpec::scalar("start", "echo").with_input(literal(21i64)))
            .step(StepSpec::scalar("twice", "double").from_step("start")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.outputs["twice"].as_f64(), Some(42.0));
    assert_eq!(run.attempts.len(), 2);
    assert!(run.error.is_none());
    assert!(run.started_at.is_some() && run.finished_at.is_some());
}

// Every element fails permanently with max_retries = 2
#[tokio::test]
async fn test_retries_exhausted_then_fail_fast() {
    let mut registry = TaskRegistry::new();
    let failing = register(&mut registry, always_fails(), 2);
    let after = register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "stars",
        FlowDefinition::new("stars")
            .step(StepSpec::mapped("get_stars", "fails").from_param("repos"))
            .step(StepSpec::scalar("total", "echo").from_step("get_stars")),
        params(&[("repos", Value::from(vec!["a/b", "c/d"]))]),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(failing.runs(), 6, "each element should be attempted 3 times");
    for element in [0, 1] {
        let attempts: Vec<_> = run
            .attempts_for("get_stars")
            .filter(|a| a.element == Some(element))
            .collect();
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(attempts.iter().all(|a| matches!(a.outcome, AttemptOutcome::Failed(_))));
    }

    let error = run.error.expect("failed run carries an error");
    assert_eq!(error.step.as_deref(), Some("get_stars"));
    assert!(error.message.contains("3 attempt"), "{}", error.message);

    // Later steps never start
    assert_eq!(after.created.load(Ordering::SeqCst), 0);
    assert!(!run.outputs.contains_key("total"));
}

#[tokio::test]
async fn test_flaky_task_recovers_within_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = FnFactory::new("flaky", move |ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TaskError::ExecutionFailed("not yet".to_string()))
            } else {
                Ok(ctx.input)
            }
        }
    });

    let mut registry = TaskRegistry::new();
    register(&mut registry, flaky, 2);
    let deployment = deployment(
        &registry,
        "flaky",
        FlowDefinition::new("flaky").step(StepSpec::scalar("only", "flaky").with_input(literal("ok"))),
        HashMap::new(),
    );
    let (executor, bus) = executor(registry, 4);
    let mut events = bus.subscribe();

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.outputs["only"], Value::from("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(run.attempts.last().map(|a| &a.outcome), Some(&AttemptOutcome::Succeeded));

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let RunEvent::AttemptFailed { will_retry, .. } = event {
            assert!(will_retry);
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_mapped_outputs_keep_input_order() {
    let mut registry = TaskRegistry::new();
    register(&mut registry, sleepy(), 0);
    let delays = [40, 5, 25, 1, 15, 30];
    let deployment = deployment(
        &registry,
        "ordered",
        FlowDefinition::new("ordered").step(StepSpec::mapped("wait", "sleepy").from_param("delays")),
        params(&[("delays", numbers(&delays))]),
    );
    let (executor, _bus) = executor(registry, 10);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.outputs["wait"], numbers(&delays));
}

#[tokio::test]
async fn test_mapped_elements_respect_parallel_limit() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let tracked = FnFactory::new("tracked", move |ctx| {
        let (active, peak) = (a.clone(), p.clone());
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(ctx.input)
        }
    });

    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, tracked, 0);
    let deployment = deployment(
        &registry,
        "bounded",
        FlowDefinition::new("bounded")
            .step(StepSpec::mapped("each", "tracked").with_input(literal(numbers(&[1, 2, 3, 4, 5, 6, 7])))),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 2);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(lifecycle.runs(), 7);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_empty_mapped_input_completes() {
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "empty",
        FlowDefinition::new("empty").step(StepSpec::mapped("each", "echo").from_param("items")),
        params(&[("items", Value::Array(Vec::new()))]),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.outputs["each"], Value::Array(Vec::new()));
    assert!(run.attempts.is_empty());
    assert_eq!(lifecycle.runs(), 0);
}

#[tokio::test]
async fn test_mapped_param_must_be_sequence() {
    let mut registry = TaskRegistry::new();
    register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "scalar-param",
        FlowDefinition::new("scalar-param").step(StepSpec::mapped("each", "echo").from_param("items")),
        params(&[("items", Value::from(3i64))]),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;
    assert_eq!(run.state, RunState::Failed);

    // Missing entirely
    let run = executor
        .drain_and_execute(
            Run::new(&deployment, HashMap::new(), cadencecore::RunTrigger::Manual, chrono::Utc::now()),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(run.state, RunState::Failed);
    assert!(run.error.unwrap().message.contains("items"));
}

#[tokio::test]
async fn test_siblings_finish_after_one_fails() {
    let picky = FnFactory::new("picky", |ctx| async move {
        let n = ctx.input.as_i64().unwrap_or_default();
        if n == 0 {
            return Err(TaskError::ExecutionFailed("zero".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ctx.input)
    });

    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, picky, 0);
    let deployment = deployment(
        &registry,
        "siblings",
        FlowDefinition::new("siblings")
            .step(StepSpec::mapped("each", "picky").with_input(literal(numbers(&[0, 1, 2])))),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(lifecycle.runs(), 3);
    let succeeded = run
        .attempts
        .iter()
        .filter(|a| a.outcome == AttemptOutcome::Succeeded)
        .count();
    assert_eq!(succeeded, 2, "siblings are not cancelled by a failure");
    // Attempts are recorded in element order
    assert_eq!(
        run.attempts.iter().map(|a| a.element).collect::<Vec<_>>(),
        vec![Some(0), Some(1), Some(2)]
    );
}

#[tokio::test]
async fn test_panic_crashes_without_retry() {
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, panics(), 3);
    let deployment = deployment(
        &registry,
        "panics",
        FlowDefinition::new("panics").step(StepSpec::scalar("boom", "panics")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Crashed);
    assert_eq!(lifecycle.runs(), 1);
    assert_eq!(run.attempts.len(), 1);
    assert!(matches!(&run.attempts[0].outcome, AttemptOutcome::Crashed(msg) if msg.contains("boom")));
    assert_eq!(lifecycle.shut_down.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_infrastructure_error_is_not_retried() {
    let broken = FnFactory::new("broken", |_ctx| async move {
        Err(TaskError::Infrastructure("disk full".to_string()))
    });
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, broken, 5);
    let deployment = deployment(
        &registry,
        "broken",
        FlowDefinition::new("broken").step(StepSpec::scalar("write", "broken")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Crashed);
    assert_eq!(lifecycle.runs(), 1);
    assert!(run.error.unwrap().message.contains("disk full"));
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let mut registry = TaskRegistry::new();
    let factory = sleepy();
    let lifecycle = factory.lifecycle.clone();
    registry
        .register(
            TaskSpec::new(Arc::new(factory))
                .with_retries(1, Duration::from_millis(1))
                .with_timeout(Duration::from_millis(10)),
        )
        .unwrap();
    let deployment = deployment(
        &registry,
        "slow",
        FlowDefinition::new("slow").step(StepSpec::scalar("wait", "sleepy").with_input(literal(500i64))),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(lifecycle.runs(), 2);
    assert!(run
        .attempts
        .iter()
        .all(|a| matches!(&a.outcome, AttemptOutcome::Failed(msg) if msg.contains("Timeout"))));
}

#[tokio::test]
async fn test_cancellation_marks_attempts_cancelled() {
    let mut registry = TaskRegistry::new();
    register(&mut registry, blocks(), 3);
    let deployment = deployment(
        &registry,
        "blocked",
        FlowDefinition::new("blocked")
            .step(StepSpec::mapped("each", "blocks").with_input(literal(numbers(&[1, 2]))))
            .step(StepSpec::scalar("never", "blocks")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), token)
        .await;

    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.attempts.len(), 2);
    assert!(run.attempts.iter().all(|a| a.outcome == AttemptOutcome::Cancelled));
    assert_eq!(run.attempts_for("never").count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "early",
        FlowDefinition::new("early").step(StepSpec::scalar("one", "echo")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let token = CancellationToken::new();
    token.cancel();
    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), token)
        .await;

    assert_eq!(run.state, RunState::Cancelled);
    assert!(run.started_at.is_none());
    assert_eq!(lifecycle.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_one_instance_per_step() {
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "scoped",
        FlowDefinition::new("scoped")
            .step(StepSpec::mapped("each", "echo").with_input(literal(numbers(&[1, 2, 3])))),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(lifecycle.created.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.initialized.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.shut_down.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.runs(), 3);
}

#[tokio::test]
async fn test_initialize_failure_crashes_run() {
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, echo().failing_initialize(), 2);
    let deployment = deployment(
        &registry,
        "no-resource",
        FlowDefinition::new("no-resource").step(StepSpec::scalar("one", "echo")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    assert_eq!(run.state, RunState::Crashed);
    assert_eq!(lifecycle.runs(), 0);
    assert!(run.attempts.is_empty());
}

#[tokio::test]
async fn test_terminal_run_is_left_alone() {
    let mut registry = TaskRegistry::new();
    let lifecycle = register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "done",
        FlowDefinition::new("done").step(StepSpec::scalar("one", "echo")),
        HashMap::new(),
    );
    let (executor, _bus) = executor(registry, 4);

    let mut run = Run::manual(&deployment, HashMap::new());
    run.finish(RunState::Failed, None);
    let run = executor.drain_and_execute(run, CancellationToken::new()).await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(lifecycle.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_run_events_emitted() {
    let mut registry = TaskRegistry::new();
    register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "events",
        FlowDefinition::new("events")
            .step(StepSpec::mapped("each", "echo").with_input(literal(numbers(&[1, 2, 3])))),
        HashMap::new(),
    );
    let (executor, bus) = executor(registry, 4);
    let mut events = bus.subscribe();

    let run = executor
        .drain_and_execute(Run::manual(&deployment, HashMap::new()), CancellationToken::new())
        .await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.run_id(), run.id);
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(RunEvent::RunStarted { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, RunEvent::StepStarted { elements: Some(3), .. })));
    assert!(matches!(
        seen.last(),
        Some(RunEvent::RunFinished { state: RunState::Completed, .. })
    ));
}
