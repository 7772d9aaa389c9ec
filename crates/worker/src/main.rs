use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_core::{RunId, Worker};
use serde_json::{json, Value};
use std::path::PathBuf;

mod config;
mod invoker;

use config::{AppState, KeelConfig};

#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(about = "Durable workflow execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "keel.toml", env = "KEEL_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "KEEL_DATA_DIR")]
    data_dir: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered workflows
    Workflows,

    /// Start a workflow run and drive it until it rests
    Start {
        /// Workflow name
        name: String,

        /// Run input as JSON
        #[arg(long, default_value = "{}")]
        input: String,

        /// Drive the run in-process without the queue
        #[arg(long)]
        inline: bool,
    },

    /// Show a run and its steps
    Status {
        run_id: RunId,
    },

    /// Resume a suspended run
    Resume {
        run_id: RunId,

        /// Payload handed to the suspended steps, as JSON
        #[arg(long)]
        payload: Option<String>,
    },

    /// Cancel a run
    Cancel {
        run_id: RunId,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Delete a run and its step records
    Delete {
        run_id: RunId,
    },

    /// List stored topology versions of a workflow
    Versions {
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.log_format);

    tracing::debug!("Data directory: {}", args.data_dir.display());

    let config = KeelConfig::load(&args.config, args.data_dir)?;
    let state = AppState::new(&config)?;

    match args.command {
        Command::Workflows => {
            let workflows: Vec<Value> = state
                .orchestrator
                .registry()
                .workflows()
                .into_iter()
                .map(|meta| {
                    json!({
                        "name": meta.name,
                        "source": meta.source,
                        "graph_hash": meta.graph_hash,
                        "title": meta.title,
                    })
                })
                .collect();
            print_json(&workflows)?;
        }
        Command::Start {
            name,
            input,
            inline,
        } => {
            let input = parse_json(&input).context("Invalid --input")?;
            let run = if inline {
                state.orchestrator.run_workflow_inline(&name, input).await?
            } else {
                let run = state.orchestrator.start_workflow(&name, input).await?;
                drain(&state, &config).await;
                state.orchestrator.get_run(run.id).await?
            };
            print_json(&run)?;
        }
        Command::Status { run_id } => {
            let run = state.orchestrator.get_run(run_id).await?;
            let steps = state.store.list_step_states(run_id).await?;
            print_json(&json!({ "run": run, "steps": steps }))?;
        }
        Command::Resume { run_id, payload } => {
            let payload = payload
                .as_deref()
                .map(parse_json)
                .transpose()
                .context("Invalid --payload")?;
            let run = state.orchestrator.resume_workflow(run_id, payload).await?;
            let run = if run.inline {
                run
            } else {
                drain(&state, &config).await;
                state.orchestrator.get_run(run_id).await?
            };
            print_json(&run)?;
        }
        Command::Cancel { run_id, reason } => {
            let cancelled = state.orchestrator.cancel_workflow(run_id, reason).await?;
            print_json(&json!({ "run_id": run_id, "cancelled": cancelled }))?;
        }
        Command::Delete { run_id } => {
            let deleted = state.orchestrator.delete_run(run_id).await?;
            print_json(&json!({ "run_id": run_id, "deleted": deleted }))?;
        }
        Command::Versions { name } => {
            let versions: Vec<Value> = state
                .store
                .list_workflow_versions(&name)
                .await?
                .into_iter()
                .map(|version| {
                    json!({
                        "graph_hash": version.graph_hash,
                        "source": version.source,
                        "created_at": version.created_at,
                    })
                })
                .collect();
            print_json(&versions)?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "keel=info".into());

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Process queued jobs until nothing is left to do
async fn drain(state: &AppState, config: &KeelConfig) {
    let worker = Worker::new(
        state.orchestrator.clone(),
        state.queue.clone(),
        config.worker.clone(),
    );
    let handled = worker.run_until_idle().await;
    tracing::debug!("Handled {} jobs", handled);
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("Failed to parse JSON")
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
