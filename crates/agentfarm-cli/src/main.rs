mod backends;
mod config;

use agentfarm_orchestrator::{
    AggregationStrategy, FanOutRequest, Orchestrator, Strategy, TaskSpec,
};
use clap::{Parser, Subcommand};
use config::FarmConfig;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentfarm", about = "Multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentfarm.toml")]
    config: PathBuf,

    /// Concurrency preset: default, aggressive, conservative or single
    #[arg(long)]
    preset: Option<String>,

    /// Agent selection strategy (overrides config)
    #[arg(long)]
    strategy: Option<Strategy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured agents
    Agents,
    /// Print the farm status summary
    Status,
    /// Run one task and print it once terminal
    Submit {
        /// JSON payload; anything that is not valid JSON is sent as a string
        #[arg(short, long)]
        payload: String,
        /// Required agent capability
        #[arg(long)]
        capability: Option<String>,
        /// Higher runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Preferred agent id
        #[arg(long)]
        agent: Option<String>,
    },
    /// Run a JSON array of task specs as one batch and print its report
    Batch {
        /// File holding the task specs
        #[arg(short, long)]
        file: PathBuf,
        #[arg(long, default_value = "cli-batch")]
        name: String,
    },
    /// Send one payload to every agent and print the aggregated result
    Fanout {
        #[arg(short, long)]
        payload: String,
        /// merge, vote, best or collect
        #[arg(short, long, default_value = "collect")]
        aggregation: AggregationStrategy,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = FarmConfig::load(&cli.config).await?;
    if let Some(preset) = &cli.preset {
        config.apply_preset(preset)?;
    }
    if let Some(strategy) = cli.strategy {
        config.orchestrator.strategy = strategy;
    }

    let orchestrator = Orchestrator::new(config.orchestrator.clone())?;
    for entry in &config.agents {
        let backend = backends::build_backend(entry);
        orchestrator.register_agent(entry.agent.clone(), backend)?;
    }
    info!(
        agents = config.agents.len(),
        strategy = %config.orchestrator.strategy,
        max_concurrent = config.orchestrator.max_concurrent_tasks,
        "Orchestrator ready"
    );

    let outcome = run(&orchestrator, cli.command).await;
    let aborted = orchestrator.shutdown();
    if aborted > 0 {
        info!(aborted, "Aborted tasks still running at exit");
    }
    outcome
}

async fn run(orchestrator: &Orchestrator, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Agents => print_json(&orchestrator.list_agents()),
        Commands::Status => print_json(&orchestrator.status()),
        Commands::Submit {
            payload,
            capability,
            priority,
            agent,
        } => {
            let mut spec = TaskSpec::new(parse_payload(&payload)).with_priority(priority);
            if let Some(capability) = capability {
                spec = spec.with_capability(capability);
            }
            if let Some(agent) = agent {
                spec = spec.prefer_agent(agent);
            }
            let task_id = orchestrator.submit_task(spec)?;
            let task = orchestrator.wait_for_task(task_id).await?;
            print_json(&task)
        }
        Commands::Batch { file, name } => {
            let text = tokio::fs::read_to_string(&file).await.map_err(|e| {
                anyhow::anyhow!("Failed to read batch file '{}': {}", file.display(), e)
            })?;
            let specs: Vec<TaskSpec> = serde_json::from_str(&text)?;
            let batch_id = orchestrator.submit_batch(&name, specs)?;
            orchestrator.wait_for_batch(batch_id).await?;
            print_json(&orchestrator.batch_report(batch_id)?)
        }
        Commands::Fanout {
            payload,
            aggregation,
        } => {
            let request =
                FanOutRequest::new(parse_payload(&payload)).with_aggregation(aggregation);
            let batch_id = orchestrator.fan_out(request)?;
            let batch = orchestrator.wait_for_batch(batch_id).await?;
            match batch.aggregation {
                Some(aggregation) => print_json(&aggregation),
                None => print_json(&orchestrator.batch_report(batch_id)?),
            }
        }
    }
}

fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
