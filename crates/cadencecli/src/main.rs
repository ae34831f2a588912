// crates/cadencecli/src/main.rs

use anyhow::Result;
use cadencecore::{FlowGraph, RunEvent, RunState, TaskLogLine, Value};
use cadenceruntime::{Manifest, Orchestrator, TaskRegistry};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence workflow orchestrator", long_about = None)]
struct Cli {
    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and workers for every deployment in a manifest
    Serve {
        /// Path to manifest JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Trigger one deployment now and wait for it to finish
    Run {
        /// Path to manifest JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Name of the deployment to run
        #[arg(short, long)]
        deployment: String,

        /// Parameter overrides as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Validate a manifest file
    Validate {
        /// Path to manifest JSON file
        file: PathBuf,
    },

    /// List available tasks
    Tasks,

    /// Write the stock manifest
    Init {
        /// Output file path
        #[arg(short, long, default_value = "cadence.json")]
        output: PathBuf,
    },

    /// Show upcoming fire times of each deployment
    Next {
        /// Path to manifest JSON file
        #[arg(short, long)]
        file: PathBuf,

        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { file } => serve(&file).await?,
        Commands::Run {
            file,
            deployment,
            params,
        } => run_deployment(&file, &deployment, params).await?,
        Commands::Validate { file } => validate_manifest(&file)?,
        Commands::Tasks => list_tasks()?,
        Commands::Init { output } => create_manifest(&output)?,
        Commands::Next { file, count } => show_upcoming(&file, count)?,
    }

    Ok(())
}

fn parse_overrides(params: Option<String>) -> Result<HashMap<String, Value>> {
    let Some(params) = params else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str::<serde_json::Value>(&params)? {
        serde_json::Value::Object(obj) => Ok(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        _ => Err(anyhow::anyhow!("Parameters must be a JSON object")),
    }
}

fn print_events(mut events: broadcast::Receiver<RunEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                RunEvent::RunScheduled { run_id, deployment, manual, .. } => {
                    let origin = if manual { "manual" } else { "schedule" };
                    println!("🗓️  {} run {} scheduled ({})", deployment, run_id, origin);
                }
                RunEvent::RunStarted { deployment, .. } => {
                    println!("▶️  {} started", deployment);
                }
                RunEvent::StepStarted { step, task, elements, .. } => match elements {
                    Some(n) => println!("  ⚡ Starting step: {} ({}, {} elements)", step, task, n),
                    None => println!("  ⚡ Starting step: {} ({})", step, task),
                },
                RunEvent::AttemptFailed { step, element, attempt, error, will_retry, .. } => {
                    let target = match element {
                        Some(idx) => format!("{}[{}]", step, idx),
                        None => step,
                    };
                    let next = if will_retry { ", retrying" } else { "" };
                    println!("  ❌ {} attempt {} failed: {}{}", target, attempt, error, next);
                }
                RunEvent::StepCompleted { step, duration_ms, .. } => {
                    println!("  ✅ Step {} completed in {}ms", step, duration_ms);
                }
                RunEvent::TaskLog { step, line, .. } => match line {
                    TaskLogLine::Info { message } => println!("     ℹ️  [{}] {}", step, message),
                    TaskLogLine::Warning { message } => println!("     ⚠️  [{}] {}", step, message),
                    TaskLogLine::Progress { percent, message } => match message {
                        Some(msg) => println!("     📊 [{}] {}% - {}", step, percent, msg),
                        None => println!("     📊 [{}] {}%", step, percent),
                    },
                },
                RunEvent::RunFinished { deployment, state, duration_ms, .. } => {
                    if state == RunState::Completed {
                        println!("✨ {} completed in {}ms", deployment, duration_ms);
                    } else {
                        println!("💥 {} {} after {}ms", deployment, state, duration_ms);
                    }
                }
            }
        }
    })
}

fn build_orchestrator(manifest: &Manifest) -> Result<Arc<Orchestrator>> {
    let registry = cadencetasks::standard_registry()?;
    Ok(Arc::new(Orchestrator::new(Arc::new(registry), manifest.runtime.clone())))
}

async fn serve(file: &Path) -> Result<()> {
    println!("🚀 Loading manifest from: {}", file.display());
    let manifest = Manifest::load(file)?;
    tracing::debug!(
        deployments = manifest.deployments.len(),
        workers = manifest.runtime.workers,
        "Manifest loaded"
    );
    let orchestrator = build_orchestrator(&manifest)?;

    for deployment in orchestrator.deploy_all(manifest.deployments).await? {
        println!("📋 {} ({})", deployment.name, deployment.trigger.schedule);
    }

    let printer = print_events(orchestrator.subscribe_events());
    let workers = orchestrator.start_workers();
    let clock = orchestrator.spawn_clock();

    println!("⏱️  Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    println!("🛑 Stopping, waiting for runs in flight");
    orchestrator.shutdown();
    clock.await?;
    for worker in workers {
        worker.await?;
    }
    printer.abort();
    Ok(())
}

async fn run_deployment(file: &Path, name: &str, params: Option<String>) -> Result<()> {
    let manifest = Manifest::load(file)?;
    let spec = manifest
        .find(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Deployment '{}' is not in {}", name, file.display()))?;
    let overrides = parse_overrides(params)?;
    tracing::debug!(deployment = name, overrides = overrides.len(), "Triggering one-shot run");

    let orchestrator = build_orchestrator(&manifest)?;
    orchestrator.deploy(spec).await?;

    let printer = print_events(orchestrator.subscribe_events());
    let workers = orchestrator.start_workers();

    let run_id = orchestrator.trigger(name, overrides).await?;
    let snapshot = orchestrator.wait(run_id).await?;

    orchestrator.shutdown();
    for worker in workers {
        worker.await?;
    }
    // Let the printer drain the final events
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    printer.abort();

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", snapshot.id);
    println!("   State: {}", snapshot.state);
    println!("   Attempts: {}", snapshot.attempts.len());

    if let Some(error) = &snapshot.error {
        println!("   Error: {}", error);
    }

    if snapshot.state == RunState::Completed && !snapshot.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        let mut steps: Vec<_> = snapshot.outputs.iter().collect();
        steps.sort_by(|a, b| a.0.cmp(b.0));
        for (step, value) in steps {
            println!("   {}: {}", step, value);
        }
    }

    if snapshot.state != RunState::Completed {
        return Err(anyhow::anyhow!("Run {} ended {}", snapshot.id, snapshot.state));
    }
    Ok(())
}

fn validate_manifest(file: &Path) -> Result<()> {
    println!("🔍 Validating manifest: {}", file.display());

    let manifest = Manifest::load(file)?;
    let registry = cadencetasks::standard_registry()?;
    let mut invalid = 0;

    for spec in &manifest.deployments {
        let checked = FlowGraph::define(spec.flow.clone(), &registry)
            .and_then(|flow| spec.schedule.parse().map(|trigger| (flow, trigger)))
            .and_then(|parts| spec.environment.validate().map(|_| parts));
        match checked {
            Ok((flow, trigger)) => {
                let state = if trigger.enabled { "" } else { ", disabled" };
                println!(
                    "✅ {}: flow {} ({} steps), cron {}{}",
                    spec.name,
                    flow.name(),
                    flow.steps().len(),
                    trigger.schedule,
                    state
                );
            }
            Err(e) => {
                invalid += 1;
                println!("❌ {}: {}", spec.name, e);
            }
        }
    }

    if invalid > 0 {
        return Err(anyhow::anyhow!("{} invalid deployment(s)", invalid));
    }
    println!("✨ {} deployment(s) valid", manifest.deployments.len());
    Ok(())
}

fn list_tasks() -> Result<()> {
    println!("📦 Available Tasks:");
    println!();

    let registry: TaskRegistry = cadencetasks::standard_registry()?;

    for id in registry.list_tasks() {
        let spec = registry.resolve(&id)?;
        let signature = spec.signature();
        let metadata = spec.factory.metadata();
        println!(
            "  • {} ({}) {} -> {}, retries {}",
            id, metadata.category, signature.input, signature.output, spec.max_retries
        );
        println!("    {}", metadata.description);
    }
    Ok(())
}

fn create_manifest(output: &Path) -> Result<()> {
    cadencetasks::stock_manifest().save(output)?;

    println!("✨ Created manifest: {}", output.display());
    println!();
    println!("Run a deployment with:");
    println!(
        "  cadence run --file {} --deployment data-processing-deployment --params '{{\"user_count\": 5}}'",
        output.display()
    );
    Ok(())
}

fn show_upcoming(file: &Path, count: usize) -> Result<()> {
    let manifest = Manifest::load(file)?;
    let now = Utc::now();

    for spec in &manifest.deployments {
        let trigger = spec.schedule.parse()?;
        if !trigger.enabled {
            println!("⏸️  {} is disabled", spec.name);
            continue;
        }
        println!("🗓️  {} ({})", spec.name, trigger.schedule);
        for at in trigger.schedule.upcoming(&now, count) {
            println!("     {}", at.to_rfc3339());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_override_object() {
        let overrides = parse_overrides(Some(r#"{"user_count": 5}"#.to_string())).unwrap();
        assert_eq!(overrides["user_count"].as_i64(), Some(5));
        assert!(parse_overrides(None).unwrap().is_empty());
        assert!(parse_overrides(Some("[1, 2]".to_string())).is_err());
    }

    #[test]
    fn cli_arguments_parse() {
        let cli = Cli::try_parse_from([
            "cadence",
            "run",
            "--file",
            "cadence.json",
            "--deployment",
            "github-stars-deployment",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Run { ref deployment, .. } if deployment == "github-stars-deployment"));
    }
}
