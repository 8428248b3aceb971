mod agents;
mod cancel;
mod cli;
mod config;
mod logging;
mod store;
mod workflow;

use agents::AgentRegistry;
use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::OutputMode;
use std::path::PathBuf;
use std::sync::Arc;
use store::KnowledgeStore;
use workflow::WorkflowEngine;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Mine a repository's history for insights with declarative analysis workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Use an in-memory knowledge store instead of the default database
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Emit results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run {
        /// Workflow name
        workflow: String,

        /// Workflow arguments as key=value pairs
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Show a workflow's steps without running it
    Validate {
        /// Workflow name
        workflow: String,
    },

    /// List registered workflows
    Workflows,

    /// Show recent runs from the knowledge store
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Check agents, workflows, and store reachability
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.debug, cli.quiet, cli.log_file.clone())?;

    let working_dir = cli
        .dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let registry = config::load_registry(Some(&working_dir))?;
    let store = if cli.ephemeral {
        KnowledgeStore::in_memory()?
    } else {
        KnowledgeStore::open(&KnowledgeStore::default_path()?)?
    };
    let engine = Arc::new(WorkflowEngine::new(
        registry,
        AgentRegistry::with_builtins(),
        Arc::new(store),
    ));

    let mode = if cli.json {
        OutputMode::Json
    } else if cli.quiet {
        OutputMode::Quiet
    } else {
        OutputMode::Console
    };

    let exit = match cli.command {
        Commands::Run { workflow, args } => {
            let monitor = engine.monitor().spawn();
            let code =
                cli::run_workflow(Arc::clone(&engine), &workflow, args, &working_dir, mode).await;
            monitor.abort();
            code
        }
        Commands::Validate { workflow } => cli::validate_workflow(&engine, &workflow),
        Commands::Workflows => cli::list_workflows(&engine),
        Commands::History { limit } => cli::history(&engine, limit, mode),
        Commands::Doctor => cli::doctor(&engine),
    };

    std::process::exit(exit)
}
