//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `check [config]` -- compile flows, print warnings and the route table
//! - `chat [config] --from <id>` -- talk to the flows from stdin
//! - `version` -- print build/version info

use crate::config::{self, AppConfig};
use crate::database::{Database, JsonFileDatabase, MemoryDatabase};
use crate::flows::{DispatchError, DispatchStatus, Dispatcher, FlowGraph};
use crate::logging;
use crate::provider::{ConsoleProvider, InboundEvent};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// Keyword-triggered conversational flow engine.
#[derive(Parser, Debug)]
#[command(
    name = "chatflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Run keyword-triggered conversation flows"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile the flows and print the route table.
    Check {
        /// Config file (default: $CHATFLOW_CONFIG or the user config dir).
        config: Option<PathBuf>,
    },

    /// Chat with the flows on stdin, one message per line.
    Chat {
        /// Config file (default: $CHATFLOW_CONFIG or the user config dir).
        config: Option<PathBuf>,

        /// Sender id used for every message.
        #[arg(long, default_value = "console")]
        from: String,
    },

    /// Print version, build date, and git commit information.
    Version,
}

/// Load the config and start logging with its settings.
fn load(explicit: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let path = config::resolve_config_path(explicit);
    let cfg = config::load_config(&path)?;
    if let Err(e) = logging::init_logging(&cfg.logging) {
        eprintln!("Warning: {}", e);
    }
    info!(path = %path.display(), flows = cfg.flows.len(), "loaded config");
    Ok(cfg)
}

/// Run the `check` subcommand.
pub fn handle_check(explicit: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = load(explicit)?;
    let graph = FlowGraph::compile(&cfg.flows)?;

    for warning in graph.warnings() {
        println!("warning: {}", warning);
    }
    for line in format_routes(&graph) {
        println!("{}", line);
    }
    println!("{} flow(s) compiled", graph.len());
    Ok(())
}

/// Run the `chat` subcommand.
pub async fn handle_chat(
    explicit: Option<&Path>,
    from: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = load(explicit)?;
    let graph = Arc::new(FlowGraph::compile(&cfg.flows)?);

    let database: Arc<dyn Database> = match &cfg.history.path {
        Some(path) => {
            let db = JsonFileDatabase::new(path);
            db.init().await?;
            info!(path = %path.display(), "history stored in file");
            Arc::new(db)
        }
        None => Arc::new(MemoryDatabase::new()),
    };
    let dispatcher = Dispatcher::new(
        graph,
        Arc::new(ConsoleProvider::new()),
        database,
        cfg.engine.clone(),
    );
    for name in dispatcher.missing_callbacks() {
        eprintln!("warning: callback '{}' is not available in chat mode", name);
    }

    eprintln!("Chatting as '{}'. Ctrl-D or Ctrl-C to quit.", from);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        match dispatcher.dispatch(InboundEvent::new(from, line)).await {
            Ok(outcome) if outcome.status == DispatchStatus::NoMatch => {
                eprintln!("(no flow matched)");
            }
            Ok(outcome) => debug!(?outcome, "message handled"),
            Err(DispatchError::StepFailures(failures)) => {
                for failure in failures {
                    eprintln!("error: {}", failure);
                }
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    dispatcher.shutdown();
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("chatflow {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("CHATFLOW_BUILD_DATE"));
    println!("  Git commit: {}", env!("CHATFLOW_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

/// One `keyword -> flow` line per route, padded into columns.
fn format_routes(graph: &FlowGraph) -> Vec<String> {
    let routes = graph.routes();
    let width = routes.iter().map(|r| r.keyword.len()).max().unwrap_or(0);
    routes
        .iter()
        .map(|r| format!("{:<width$} -> {}", r.keyword, r.flow, width = width))
        .collect()
}
