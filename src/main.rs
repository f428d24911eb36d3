use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mcp_agent::evaluation::{default_cases, run_evaluation, EvaluationPlan};
use mcp_agent::{init_tracing, AgentConfig, ExecutionDriver, LogOptions};

#[derive(Parser)]
#[command(
    name = "mcp-agent",
    about = "Answer questions with a local LLM and tools from MCP servers",
    version
)]
struct Cli {
    /// Path to agent.yaml (default: $MCP_AGENT_CONFIG, then search upward)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one request and print the JSON response
    Query {
        /// The request text
        command: String,
        /// Model identifier (default: the configured default_model)
        #[arg(short, long, default_value = "")]
        model: String,
        /// Record every decision and tool call in the response
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run the evaluation questions against one or more models
    Eval {
        /// Model to evaluate; repeat for several (default: llama3.2, mistral, qwen3)
        #[arg(short, long = "model")]
        models: Vec<String>,
        /// Runs per question
        #[arg(short, long, default_value_t = 3)]
        iterations: u32,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(LogOptions {
        json: cli.log_json,
        stderr: cli.log_stderr,
    })
    .context("failed to initialize logging")?;

    let config = AgentConfig::load_or_default(cli.config.as_deref())?;
    let driver = ExecutionDriver::from_config(config);

    let outcome = match cli.command {
        Commands::Query {
            command,
            model,
            verbose,
        } => {
            let rendered = match driver.query_with(&command, &model, verbose).await {
                Ok(response) => serde_json::to_string_pretty(&response),
                Err(error) => serde_json::to_string_pretty(&error),
            };
            rendered
                .map(|json| println!("{json}"))
                .context("failed to render response")
        }
        Commands::Eval {
            models,
            iterations,
            json,
        } => {
            let mut plan = EvaluationPlan::default();
            if !models.is_empty() {
                plan.models = models;
            }
            plan.iterations = iterations;

            let report = run_evaluation(&driver, &plan, &default_cases()).await;
            if json {
                serde_json::to_string_pretty(&report)
                    .map(|out| println!("{out}"))
                    .context("failed to render report")
            } else {
                print!("{report}");
                Ok(())
            }
        }
    };

    driver.shutdown().await;
    outcome
}
