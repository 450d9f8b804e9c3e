//! `loom` command line client: sends one message on a thread's active
//! worldline and prints the streamed turn as it reconciles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use loom_core::events::TimelineEvent;
use loom_session::{HttpApi, SessionOrchestrator, SessionSignal, WorldlineManager};
use loom_store::{CacheRepo, Database, PrefsRepo};
use loom_telemetry::LogConfig;
use loom_timeline::{pair_cells, TimelineCell};

#[derive(Parser)]
#[command(name = "loom", version, about = "Streaming client for branching conversation threads")]
struct Cli {
    /// Workspace server base URL.
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server: String,

    /// Thread id to attach to.
    #[arg(long)]
    thread: String,

    /// Model provider passed through to the server.
    #[arg(long, default_value = "openai")]
    provider: String,

    #[arg(long, default_value = "gpt-4.1")]
    model: String,

    /// Cap on tool-call iterations per turn.
    #[arg(long, default_value_t = 10)]
    max_iterations: u32,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// SQLite file for the worldline cache, preferences, and warn+ logs.
    /// Defaults to ~/.loom/loom.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Skip the local store entirely; every run starts cold.
    #[arg(long)]
    no_db: bool,

    /// The message to send.
    prompt: String,
}

fn default_db_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".loom").join("loom.db"))
}

fn open_store(path: &PathBuf) -> anyhow::Result<(PrefsRepo, CacheRepo)> {
    let db = Database::open(path)
        .with_context(|| format!("opening database at {}", path.display()))?;
    Ok((PrefsRepo::new(db.clone()), CacheRepo::new(db)))
}

fn render_cell(cell: &TimelineCell) {
    let text = |event: &TimelineEvent| {
        event
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    match cell {
        TimelineCell::Message(event) => {
            println!("[{}] {}", event.event_type, text(event));
        }
        TimelineCell::Marker(event) => {
            println!("-- {} --", event.event_type);
        }
        TimelineCell::Exchange { call, result } => {
            println!("[{}] {}", call.event_type, call.payload);
            match result {
                Some(result) => println!("[{}] {}", result.event_type, result.payload),
                None => println!("[pending result]"),
            }
        }
        TimelineCell::OrphanResult(event) => {
            println!("[orphan {}] {}", event.event_type, event.payload);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let db_path = if cli.no_db { None } else { cli.db.clone().or_else(default_db_path) };
    if let Some(dir) = db_path.as_ref().and_then(|p| p.parent()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
    }
    let _telemetry = loom_telemetry::init(LogConfig {
        json: cli.json_logs,
        sink_path: db_path.clone(),
        ..LogConfig::default()
    });

    let (prefs, cache) = match &db_path {
        Some(path) => match open_store(path) {
            Ok((prefs, cache)) => (Some(prefs), Some(cache)),
            Err(err) => {
                warn!(error = %err, "local store unavailable; continuing without it");
                (None, None)
            }
        },
        None => (None, None),
    };

    let api = Arc::new(HttpApi::new(&cli.server).context("building API client")?);
    let thread_id = loom_core::ids::ThreadId::from_raw(&cli.thread);
    let manager = Arc::new(WorldlineManager::new(api.clone(), thread_id, prefs, cache));
    manager
        .hydrate()
        .await
        .context("hydrating worldlines for thread")?;
    info!(
        thread = %manager.thread_id(),
        worldlines = manager.worldlines().len(),
        "session ready"
    );

    let orchestrator = SessionOrchestrator::new(
        api,
        manager,
        cli.provider,
        cli.model,
        cli.max_iterations,
    );
    let mut signals = orchestrator.subscribe();
    orchestrator.submit(&cli.prompt).await?;

    loop {
        match signals.recv().await {
            Ok(SessionSignal::Status { text, .. }) => {
                if let Some(message) = text.strip_prefix("Error: ") {
                    anyhow::bail!("turn failed: {message}");
                }
                eprintln!("{text}");
            }
            Ok(SessionSignal::TurnCompleted { .. }) => break,
            Ok(_) => {}
            Err(_) => anyhow::bail!("signal channel closed before the turn finished"),
        }
    }

    let snapshot = orchestrator.snapshot();
    if let Some(active) = &snapshot.active {
        if let Some(events) = snapshot.events.get(active) {
            for cell in pair_cells(events) {
                render_cell(&cell);
            }
        }
    }
    Ok(())
}
