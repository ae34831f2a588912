mod common;

use cadencecore::{FlowDefinition, Run, RunState, StepSpec};
use cadenceruntime::{RunStore, TaskRegistry};
use common::*;
use std::collections::HashMap;

#[tokio::test]
async fn test_finished_runs_leave_the_store() {
    let mut registry = TaskRegistry::new();
    register(&mut registry, echo(), 0);
    let deployment = deployment(
        &registry,
        "stored",
        FlowDefinition::new("stored").step(StepSpec::scalar("one", "echo")),
        HashMap::new(),
    );

    let store = RunStore::new();
    let mut run = Run::manual(&deployment, HashMap::new());
    store.insert(&run).await;
    let mut receiver = store.subscribe(run.id).await.unwrap();

    store.mark_running(run.id).await;
    assert_eq!(store.get(run.id).await.unwrap().state, RunState::Running);
    assert_eq!(store.active().await.len(), 1);

    run.start();
    run.finish(RunState::Completed, None);
    store.complete(run.snapshot()).await;

    assert!(store.is_empty().await);
    assert!(store.get(run.id).await.is_none());
    assert!(store.active().await.is_empty());

    // Subscribers from before completion still see the final snapshot
    let last = receiver
        .wait_for(|snapshot| snapshot.state.is_terminal())
        .await
        .unwrap()
        .clone();
    assert_eq!(last.state, RunState::Completed);
}

#[tokio::test]
async fn test_cancel_unknown_run() {
    let store = RunStore::new();
    assert!(store.cancel(uuid::Uuid::new_v4()).await.is_err());
    assert_eq!(store.len().await, 0);
}
