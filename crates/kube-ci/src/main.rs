//! CLI for running one-off executions on a Kubernetes cluster
//!
//! Run `kube-ci --help` for usage information.

// CLI binaries legitimately need print! for user output
#![allow(clippy::disallowed_macros)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube_ci::{
    CancellationToken, ExecutionId, ExecutionRequest, KubeRunner, NamespacePolicy, Outcome,
    RunnerConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kube-ci")]
#[command(about = "Run shell commands in an ephemeral Kubernetes Job and print their output")]
#[command(version)]
struct Cli {
    /// Output format: text, json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Runner configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run commands in a container and print the output
    Run {
        /// Container image
        #[arg(short, long)]
        image: String,

        /// Shell command to run (repeat for several, run in order)
        #[arg(short = 'c', long = "command", required = true)]
        commands: Vec<String>,

        /// Execution identifier (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Deadline in seconds (overrides the configuration)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Run in this existing namespace instead of a per-execution one
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Delete a Job left behind by an earlier run
    Delete {
        /// Namespace of the Job
        #[arg(short, long)]
        namespace: String,

        /// Name of the Job
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for execution output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("kube_ci=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    });

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            image,
            commands,
            id,
            timeout,
            namespace,
        } => {
            if let Some(seconds) = timeout {
                config.timeout_seconds = seconds;
            }
            if let Some(name) = namespace {
                config.namespace = NamespacePolicy::Shared { name };
            }
            let request = ExecutionRequest::new(image, commands);
            let execution_id = id.map_or_else(|| ExecutionId::timestamped("ci"), ExecutionId::new);
            run(config, &request, &execution_id, cli.format).await?;
        }
        Commands::Delete { namespace, name } => {
            let runner = KubeRunner::connect(config)
                .await
                .context("Failed to connect to the cluster")?;
            runner
                .delete_object(&namespace, &name)
                .await
                .with_context(|| format!("Failed to delete {namespace}/{name}"))?;
            info!(namespace = %namespace, name = %name, "Deleted");
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<RunnerConfig> {
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    config.apply_env().context("Invalid environment override")?;

    if let Some(path) = &cli.kubeconfig {
        config.kubeconfig = Some(path.clone());
    }
    if let Some(context) = &cli.context {
        config.context = Some(context.clone());
    }

    Ok(config)
}

async fn run(
    config: RunnerConfig,
    request: &ExecutionRequest,
    execution_id: &ExecutionId,
    format: OutputFormat,
) -> Result<()> {
    let runner = KubeRunner::connect(config)
        .await
        .context("Failed to connect to the cluster")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            ctrl_c.cancel();
        }
    });

    let result = runner
        .run_job(&cancel, request, execution_id)
        .await
        .with_context(|| format!("Execution {execution_id} failed"))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Text => {
            print!("{}", result.output);
        }
    }
    std::io::stdout().flush()?;

    if let Outcome::Failed { exit_code } = result.outcome {
        std::process::exit(exit_code.filter(|code| *code != 0).unwrap_or(1));
    }

    Ok(())
}
