use cadencecore::{FlowDefinition, FlowGraph, InputRef, RunState, StepSpec, Value};
use cadenceruntime::{Manifest, Orchestrator, RuntimeConfig};
use cadencetasks::{stock_manifest, standard_registry, API_URL_VAR};
use std::collections::HashMap;
use std::sync::Arc;

#[test]
fn test_standard_tasks_are_registered() {
    let registry = standard_registry().unwrap();
    assert_eq!(
        registry.list_tasks(),
        vec![
            "debug.log",
            "github.stars",
            "math.sum",
            "securities.buy",
            "users.fetch",
            "users.process",
            "users.summarize",
        ]
    );

    let stars = registry.resolve("github.stars").unwrap();
    assert_eq!(stars.max_attempts(), 3);
    assert_eq!(stars.retry_delay.as_secs(), 5);
}

#[test]
fn test_stock_flows_validate() {
    let registry = standard_registry().unwrap();
    for spec in stock_manifest().deployments {
        let flow = FlowGraph::define(spec.flow.clone(), &registry);
        assert!(flow.is_ok(), "{} failed validation: {:?}", spec.name, flow.err());
        assert!(spec.environment.validate().is_ok());
        assert!(spec.schedule.parse().is_ok());
    }
}

#[test]
fn test_stock_manifest_survives_json() {
    let manifest = stock_manifest();
    let json = serde_json::to_string_pretty(&manifest).unwrap();
    let parsed = Manifest::from_json(&json).unwrap();
    assert_eq!(parsed, manifest);
    assert_eq!(
        parsed.find("github-stars-deployment").unwrap().schedule.cron,
        "0 */6 * * *"
    );
}

#[tokio::test]
async fn test_buy_securities_runs() {
    let orchestrator = Orchestrator::new(Arc::new(standard_registry().unwrap()), RuntimeConfig::default());
    orchestrator.deploy_all(stock_manifest().deployments).await.unwrap();
    let workers = orchestrator.start_workers();

    let run_id = orchestrator
        .trigger("buy-securities-deployment", HashMap::new())
        .await
        .unwrap();
    let snapshot = orchestrator.wait(run_id).await.unwrap();

    assert_eq!(snapshot.state, RunState::Completed);
    let order = snapshot.outputs["buy"].as_object().unwrap();
    assert_eq!(order["status"], Value::from("submitted"));
    assert_eq!(order["api"], Value::from("http://cadence-server:8080/api"));
    assert!(API_URL_VAR.starts_with("CADENCE"));

    orchestrator.shutdown();
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test]
async fn test_sum_of_literal_sequence() {
    let registry = Arc::new(standard_registry().unwrap());
    let orchestrator = Orchestrator::new(registry, RuntimeConfig::default());
    let mut spec = stock_manifest().deployments.remove(2);
    spec.name = "sum".to_string();
    spec.flow = FlowDefinition::new("sum-flow")
        .step(StepSpec::scalar("echo", "debug.log").with_input(InputRef::Literal(Value::from(vec![1i64, 2, 3]))))
        .step(StepSpec::scalar("total", "math.sum").from_step("echo"));
    orchestrator.deploy(spec).await.unwrap();
    let _workers = orchestrator.start_workers();

    let run_id = orchestrator.trigger("sum", HashMap::new()).await.unwrap();
    let snapshot = orchestrator.wait(run_id).await.unwrap();

    assert_eq!(snapshot.state, RunState::Completed);
    assert_eq!(snapshot.outputs["total"].as_f64(), Some(6.0));
    orchestrator.shutdown();
}
