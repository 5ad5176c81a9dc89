use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use maestro::config::Config;
use maestro::driver::{Driver, RunOutcome};
use maestro::events::EventStore;
use maestro::hooks;
use maestro::worker::CommandWorker;
use maestro::{mlog, Result, TaskGraph};

/// Maestro - agent build orchestrator over a task graph
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a task graph to completion
    Run {
        /// Path to the PRD task-graph document (JSON)
        prd: PathBuf,

        /// Session ID to record under (generated if omitted)
        #[arg(long)]
        session: Option<String>,
    },

    /// Resume an interrupted session, skipping completed tasks
    Resume {
        /// Session ID to resume
        session_id: String,

        /// Path to the PRD task-graph document (JSON)
        prd: PathBuf,
    },

    /// Print a session's event log in write order
    Replay {
        /// Session ID to replay
        session_id: String,
    },

    /// List recorded sessions
    Sessions,

    /// Show which configured features would be wired, without running
    Features,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    maestro::log::init_with_debug(cli.debug);
    Config::ensure_dirs()?;
    let config = Config::load()?;

    match cli.command {
        Command::Run { prd, session } => {
            let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());
            let events = EventStore::create(
                &Config::sessions_dir()?,
                &session_id,
                &prd.display().to_string(),
            )?;
            let mut graph = TaskGraph::load(&prd)?;
            let outcome = drive(config, events, prd, &mut graph).await?;
            report(&session_id, &outcome);
        }
        Command::Resume { session_id, prd } => {
            let (events, completed) = EventStore::resume(&Config::sessions_dir()?, &session_id)?;
            let mut graph = TaskGraph::load(&prd)?;
            let skipped = Driver::skip_completed(&mut graph, &completed);
            mlog!("Resuming {}: skipping {} completed task(s)", session_id, skipped);
            let outcome = drive(config, events, prd, &mut graph).await?;
            report(&session_id, &outcome);
        }
        Command::Replay { session_id } => {
            let events = EventStore::replay(&Config::sessions_dir()?, &session_id)?;
            for event in events {
                println!(
                    "{} {} {}{}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.event_type,
                    event
                        .task_id
                        .map(|id| format!("[{}] ", id))
                        .unwrap_or_default(),
                    event.data
                );
            }
        }
        Command::Sessions => {
            for id in EventStore::list_sessions(&Config::sessions_dir()?)? {
                println!("{}", id);
            }
        }
        Command::Features => {
            let summary = hooks::wiring_summary(&config.features);
            println!("wired:        {}", summary.wired.join(", "));
            println!("skipped:      {}", summary.skipped.join(", "));
            println!("unrecognized: {}", summary.unrecognized.join(", "));
        }
    }
    Ok(())
}

async fn drive(
    config: Config,
    events: EventStore,
    prd: PathBuf,
    graph: &mut TaskGraph,
) -> Result<RunOutcome> {
    let worker = Arc::new(CommandWorker::from_config(&config));
    let mut driver = Driver::new(config, worker, events, prd, Config::outputs_dir()?)?;

    let cancel = driver.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    driver.run(graph).await
}

fn report(session_id: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::AllDone => println!("Session {}: all tasks done", session_id),
        RunOutcome::TasksFailed { failed } => {
            println!("Session {}: halted, {} task(s) failed:", session_id, failed.len());
            for id in failed {
                println!("  {}", id);
            }
        }
        RunOutcome::Blocked { remaining, cycles } => {
            println!(
                "Session {}: blocked with {} unfinished task(s)",
                session_id,
                remaining.len()
            );
            for cycle in cycles {
                let ids: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
                println!("  dependency cycle: {}", ids.join(" -> "));
            }
        }
        RunOutcome::IterationLimit => {
            println!("Session {}: stopped at the iteration limit", session_id)
        }
        RunOutcome::Cancelled => println!("Session {}: cancelled", session_id),
    }
}
