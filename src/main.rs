mod agents;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use finflow_core::config::AppConfig;
use finflow_core::definition::WorkflowDefinition;
use finflow_core::event::WorkflowEvent;
use finflow_core::types::{ExecutionId, StepStatus};
use finflow_engine::{compile, WorkflowEngine, WorkflowResult};

#[derive(Parser)]
#[command(name = "finflow", version, about = "Dependency-aware workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "finflow.toml", env = "FINFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and print its execution waves
    Validate {
        /// Workflow definition (.yaml, .yml or .json)
        file: PathBuf,
    },
    /// Run a workflow with the built-in agents
    Run {
        /// Workflow definition (.yaml, .yml or .json)
        file: PathBuf,
        /// Global input as inline JSON, or @path to a JSON file
        #[arg(short, long)]
        input: Option<String>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("finflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "finflow", &mut std::io::stdout());
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { file } => {
            let definition = WorkflowDefinition::load(file)
                .with_context(|| format!("loading workflow {}", file.display()))?;
            let plan = compile(&definition)?;
            println!(
                "{} v{}: {} steps in {} waves",
                definition.id,
                definition.version,
                plan.len(),
                plan.num_waves()
            );
            for (index, wave) in plan.waves().iter().enumerate() {
                println!("  wave {}: {}", index, wave.join(", "));
            }
        }
        Commands::Run { file, input, json } => {
            let config = load_config(&cli.config)?;
            let definition = WorkflowDefinition::load(file)
                .with_context(|| format!("loading workflow {}", file.display()))?;
            let input = parse_input(input.as_deref())?;
            let result = run(&config, definition, input).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            if !result.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        Ok(AppConfig::default())
    }
}

/// Inline JSON, `@file` JSON, or null when absent.
fn parse_input(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        None => Ok(Value::Null),
        Some(raw) => {
            let text = match raw.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading input file {}", path))?,
                None => raw.to_string(),
            };
            serde_json::from_str(&text).context("input is not valid JSON")
        }
    }
}

async fn run(
    config: &AppConfig,
    definition: WorkflowDefinition,
    input: Value,
) -> anyhow::Result<WorkflowResult> {
    let engine = WorkflowEngine::from_config(agents::builtin_registry(), config);

    // Subscribe before submitting so the first wave is not missed.
    let mut rx = engine.subscribe();
    let execution_id = engine.submit_workflow(definition, input).await?;
    let watched = execution_id.clone();

    let print_handle = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.execution_id() != &watched {
                continue;
            }
            match event {
                WorkflowEvent::WaveStarted { wave, steps, .. } => {
                    eprintln!("[wave {}] {}", wave, steps.join(", "));
                }
                WorkflowEvent::StepRetrying {
                    step,
                    attempt,
                    backoff_ms,
                    error,
                    ..
                } => {
                    eprintln!("[{}: retry after attempt {}, {}ms] {}", step, attempt, backoff_ms, error);
                }
                WorkflowEvent::StepFinished { step, status, attempts, .. } => {
                    eprintln!("[{}: {}] attempts={}", step, status, attempts);
                }
                WorkflowEvent::RunFinished { .. } => break,
                _ => {}
            }
        }
    });

    let result = tokio::select! {
        result = engine.wait(&execution_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel(&engine, &execution_id).await;
            engine.wait(&execution_id).await?
        }
    };
    print_handle.await.ok();

    Ok(WorkflowResult::clone(&result))
}

async fn cancel(engine: &WorkflowEngine, execution_id: &ExecutionId) {
    warn!(execution_id = %execution_id, "Interrupted, cancelling run");
    eprintln!("\nCancelling... in-flight steps finish their current attempt.");
    engine.cancel_workflow(execution_id).await;
}

fn print_result(result: &WorkflowResult) {
    let summary = result.summary();
    println!(
        "\n{} [{}] {} in {}ms",
        result.workflow_id(),
        result.execution_id(),
        result.overall_status(),
        result.elapsed_ms()
    );
    println!(
        "  completed: {}  failed: {}  skipped: {}  cancelled: {}  not started: {}",
        summary.completed, summary.failed, summary.skipped, summary.cancelled, summary.not_started
    );
    for step in result.step_results().values() {
        match step.status {
            StepStatus::Completed => {
                let output = step
                    .output
                    .as_ref()
                    .map(|o| truncate(&o.to_string(), 120))
                    .unwrap_or_default();
                println!("  ✓ {} ({} attempts): {}", step.step_name, step.attempts, output);
            }
            _ => {
                let error = step.error.as_ref().map(|e| e.to_string()).unwrap_or_default();
                println!("  ✗ {} [{}]: {}", step.step_name, step.status, error);
            }
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len).collect();
        format!("{}...", head)
    }
}
