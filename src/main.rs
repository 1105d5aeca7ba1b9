//! OpenMolt Agent - Entry Point
//!
//! Modes:
//! - Default: run the decision loop until Ctrl-C, reading operator
//!   commands (run, pause, resume, status) from stdin
//! - --once: run a single cycle and exit
//! - --status / --consolidate / --purge <id>: operator maintenance

use anyhow::Context;
use openmolt::{
    Agent, Config, ConsolidationTrigger, CycleScheduler, HttpPlatformClient, ChatReasoningEngine, SchedulerHandle,
    SqliteStore, SystemClock,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn open_agent(config: &Config) -> anyhow::Result<Agent> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path).context("opening state database")?);
    let embedder = config.embedder.build()?;
    let platform = Arc::new(HttpPlatformClient::new(config.platform.clone())?);
    let agent = Agent::open(config.agent.clone(), store, embedder, platform, Arc::new(SystemClock))?;
    Ok(agent)
}

async fn read_commands(handle: SchedulerHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin closed: {}", e);
                break;
            }
        };
        match line.trim() {
            "" => {}
            "run" => {
                if !handle.run_now() {
                    info!("Run already pending");
                }
            }
            "pause" => handle.pause(),
            "resume" => handle.resume(),
            "status" => println!("{:?}", handle.status()),
            "stop" | "quit" => {
                handle.shutdown();
                break;
            }
            other => warn!("Unknown command: {} (run, pause, resume, status, stop)", other),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let once_mode = args.iter().any(|a| a == "--once");
    let status_mode = args.iter().any(|a| a == "--status");
    let consolidate_mode = args.iter().any(|a| a == "--consolidate");
    let purge_id = args
        .iter()
        .position(|a| a == "--purge")
        .map(|i| args.get(i + 1).cloned().context("--purge needs an entry id"))
        .transpose()?;
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("OpenMolt Agent v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: openmolt [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --once           Run one decision cycle and exit");
        println!("  --status         Print memory, archive and cooldown status");
        println!("  --consolidate    Run a consolidation pass now");
        println!("  --purge <id>     Delete one archival entry");
        println!("  --help, -h       Show this help");
        println!();
        println!("Default: run continuously; stdin accepts run, pause, resume, status, stop");
        println!();
        println!("Environment variables:");
        println!("  OPENMOLT_API_KEY     Platform API key");
        println!("  OPENMOLT_HANDLE      Agent handle on the platform");
        println!("  OPENMOLT_DB_PATH     State database (default: data dir/openmolt/agent.db)");
        println!("  OPENMOLT_LLM_URL     OpenAI-compatible endpoint for reasoning");
        println!("  OPENMOLT_EMBEDDER    hash or ollama");
        return Ok(());
    }

    let daemon_mode = !(once_mode || status_mode || consolidate_mode || purge_id.is_some());

    // Setup logging based on mode
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if daemon_mode {
        // Long-running - log to stderr as JSON
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        // Operator commands - readable output
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    let mut agent = open_agent(&config)?;

    if status_mode {
        print!("{}", agent.status_report());
        return Ok(());
    }

    if let Some(id) = purge_id {
        if agent.archive.purge(&id)? {
            println!("purged {}", id);
        } else {
            println!("no archival entry {}", id);
        }
        return Ok(());
    }

    if consolidate_mode {
        match agent.consolidate(ConsolidationTrigger::Manual).await? {
            Some(report) => println!("{:#?}", report),
            None => println!("consolidation skipped, see log"),
        }
        return Ok(());
    }

    let engine = Arc::new(ChatReasoningEngine::new(config.reasoning.clone())?);
    let (mut scheduler, handle) = CycleScheduler::new(agent, engine, config.scheduler.clone());

    if once_mode {
        let report = scheduler.run_cycle().await?;
        println!("{:#?}", report);
        return Ok(());
    }

    info!("OpenMolt Agent v{} as {}", env!("CARGO_PKG_VERSION"), config.agent.handle);

    let mut loop_task = tokio::spawn(scheduler.run());
    let command_task = tokio::spawn(read_commands(handle.clone()));

    // a "stop" command ends the loop on its own
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Shutdown requested");
            handle.shutdown();
            None
        }
        joined = &mut loop_task => Some(joined),
    };
    let agent = match finished {
        Some(joined) => joined,
        None => loop_task.await,
    }
    .context("scheduler task panicked")?;
    command_task.abort();
    info!("Final state:\n{}", agent.status_report());
    Ok(())
}
