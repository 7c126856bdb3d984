//! Command-line client for proxy test sessions.
//!
//! Run with: cargo run -p speedtest-cli -- run --config ./clash.yaml hk-01 jp-02
//!
//! The runner's endpoints come from `SPEEDTEST_API_URL` / `SPEEDTEST_WS_URL`
//! or the matching flags.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use speedtest_core::{
    ClientConfig, MessageDispatcher, SessionEvent, SessionUpdate, TestConfig, TestMode,
};
use speedtest_session::{
    ExportFormat, SessionController, SessionMeta, SessionPhase, SessionStore, StopOutcome,
    storage::FileSlot,
};
use speedtest_transport::{ConnectionManager, HttpStarter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "speedtest", about = "Run and review proxy speed/unlock tests")]
struct Cli {
    /// Runner HTTP API base URL.
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Runner push-channel URL.
    #[arg(long, global = true)]
    ws_url: Option<String>,
    /// Directory holding saved sessions.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test the given targets and save the session when it completes.
    Run {
        /// Proxy configuration path or subscription URL.
        #[arg(long)]
        config: String,
        /// Target names to test.
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long, value_enum, default_value_t = Mode::Both)]
        mode: Mode,
        /// Only test these protocols.
        #[arg(long = "protocol")]
        protocols: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Do not save the completed session.
        #[arg(long)]
        no_save: bool,
    },
    /// Manage saved sessions.
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    List,
    Show { id: Uuid },
    Delete {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    Clear,
    Stats,
    Export {
        /// Sessions to export; all when empty.
        ids: Vec<Uuid>,
        #[arg(long, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Import { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Speed,
    Unlock,
    Both,
}

impl From<Mode> for TestMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Speed => Self::SpeedOnly,
            Mode::Unlock => Self::UnlockOnly,
            Mode::Both => Self::Both,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = client_config(&cli)?;
    let store = SessionStore::new(FileSlot::in_dir(store_dir(&config)?), config.store);

    match cli.command {
        Command::Run {
            config: config_paths,
            targets,
            mode,
            protocols,
            notes,
            tags,
            no_save,
        } => {
            let test = TestConfig::new(config_paths, targets)
                .with_mode(mode.into())
                .with_protocols(protocols);
            let Some(session) = run(&config, test).await? else {
                return Ok(());
            };
            if no_save {
                return Ok(());
            }

            let mut meta = SessionMeta::derive(&session.start, &session.results, &session.completion);
            if let Some(notes) = notes {
                meta = meta.with_notes(notes);
            }
            if !tags.is_empty() {
                meta = meta.with_tags(tags);
            }
            let id = store
                .save(session.start, session.results, session.completion, meta)
                .await?;
            println!("Saved session {id}");
        }
        Command::History { command } => history(&store, command).await?,
    }

    Ok(())
}

fn client_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(api_url) = &cli.api_url {
        config.api_url.clone_from(api_url);
    }
    if let Some(ws_url) = &cli.ws_url {
        config.ws_url.clone_from(ws_url);
    }
    if let Some(store) = &cli.store {
        config.store_path = Some(store.clone());
    }
    config.validate()?;
    Ok(config)
}

fn store_dir(config: &ClientConfig) -> anyhow::Result<PathBuf> {
    if let Some(path) = &config.store_path {
        return Ok(path.clone());
    }
    dirs::data_dir()
        .map(|dir| dir.join("speedtest"))
        .context("no data directory; pass --store")
}

async fn run(
    config: &ClientConfig,
    test: TestConfig,
) -> anyhow::Result<Option<speedtest_session::CompletedSession>> {
    let dispatcher = Arc::new(MessageDispatcher::new());
    let connection = Arc::new(ConnectionManager::new(
        config.ws_url.clone(),
        config.reconnect,
        Arc::clone(&dispatcher),
    ));
    connection.connect();

    let mut connected = connection.connected();
    tokio::time::timeout(CONNECT_TIMEOUT, connected.wait_for(|c| *c))
        .await
        .with_context(|| format!("could not reach {}", config.ws_url))??;

    let controller = Arc::new(SessionController::new(
        HttpStarter::new(&config.api_url),
        Arc::clone(&connection),
        Arc::clone(&dispatcher),
    ));
    let watcher = controller.spawn_watcher();
    let mut updates = dispatcher.subscribe();
    let mut phase = controller.subscribe_phase();

    let task_id = controller.start(test).await?;
    println!("Task {task_id} started");

    loop {
        if controller.phase().is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if let StopOutcome::Aborted { cancel_sent } = controller.stop() {
                    println!("Stopped (cancel request {})", if cancel_sent { "sent" } else { "not delivered" });
                }
            }
            update = updates.recv() => match update {
                Ok(SessionUpdate::Applied(event)) => print_event(&event),
                Ok(SessionUpdate::Cleared) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed session updates");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    watcher.abort();
    connection.disconnect();

    match controller.phase() {
        SessionPhase::Completed => Ok(controller.completed_session()),
        SessionPhase::Cancelled => {
            println!("Runner cancelled the session");
            Ok(None)
        }
        SessionPhase::Aborted => Ok(None),
        other => bail!("session ended in unexpected phase {other:?}"),
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Start(start) => println!("Testing {} targets", start.total_targets),
        SessionEvent::Progress(p) => println!(
            "[{}/{}] {:.0}% {} {}",
            p.completed_count,
            p.total_count,
            p.progress_percent,
            p.current_stage.as_deref().unwrap_or(""),
            p.current_target
        ),
        SessionEvent::Result(r) => println!(
            "{:<24} {:>8.1} ms {:>8.2} Mbps {:?}",
            r.target_name, r.latency_ms, r.download_mbps, r.status
        ),
        SessionEvent::Complete(c) => println!(
            "Done: {}/{} ok in {}, best {}",
            c.successful, c.total_tested, c.duration, c.best_target
        ),
        SessionEvent::Cancelled(c) => println!("Cancelled: {}", c.message),
        SessionEvent::Error(e) => eprintln!("Error: {}", e.message),
    }
}

async fn history(
    store: &SessionStore<FileSlot>,
    command: HistoryCommand,
) -> anyhow::Result<()> {
    match command {
        HistoryCommand::List => {
            for s in store.list_summaries().await? {
                println!(
                    "{}  {}  {:<6} {}/{} ok  {:.2} Mbps  {}",
                    s.id,
                    s.saved_at.format("%Y-%m-%d %H:%M"),
                    s.test_type.as_str(),
                    s.successful,
                    s.total_targets,
                    s.avg_download_mbps,
                    s.config_path
                );
            }
        }
        HistoryCommand::Show { id } => {
            let record = store.get(id).await?.with_context(|| format!("no session {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        HistoryCommand::Delete { ids } => {
            let removed = store.delete_many(&ids).await?;
            println!("Deleted {removed} session(s)");
        }
        HistoryCommand::Clear => {
            store.clear_all().await?;
            println!("Cleared all sessions");
        }
        HistoryCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&store.stats().await?)?);
        }
        HistoryCommand::Export {
            ids,
            format,
            output,
        } => {
            let ids = (!ids.is_empty()).then_some(ids.as_slice());
            let exported = store.export(ids, format).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, exported).await?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{exported}"),
            }
        }
        HistoryCommand::Import { file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let kept = store.import(&contents).await?;
            println!("Imported {kept} session(s)");
        }
    }
    Ok(())
}
