use std::{
    io,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use clap::{error::ErrorKind, Parser};
use tracing_subscriber::EnvFilter;

use git_graph_sync::{
    config::GraphSyncConfig,
    history::write_history,
    session::{DeliveryMode, SessionOptions, SyncSession},
    store::{ObjectStore, Store, StoreBackend},
    transport::WebSocketTransport,
    watch::watch_objects,
};

/// Stream a git repository's object graph to a WebSocket observer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Git repository directory whose objects are watched
    repo: PathBuf,

    /// Observer address, `host:port[/path]` or a ws:// URL
    endpoint: String,

    /// How objects are read
    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,

    /// How the initial snapshot is sent
    #[arg(long, value_enum)]
    delivery: Option<DeliveryMode>,

    /// Print the newest N commits and their trees before syncing
    #[arg(long, value_name = "N", num_args = 0..=1)]
    history: Option<Option<usize>>,

    /// Config file (default ~/.config/git-graph-sync/config.yaml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    init_tracing();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the session ended gracefully
fn run(cli: Cli) -> Result<bool> {
    let mut config = GraphSyncConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(delivery) = cli.delivery {
        config.delivery = delivery;
    }

    let store = Store::open(config.backend, &cli.repo, config.verify_hashes)
        .with_context(|| format!("Failed to open repository at {}", cli.repo.display()))?;

    if let Some(count) = cli.history {
        let count = count.unwrap_or(config.history_commits);
        let stdout = io::stdout();
        write_history(&store, count, &mut stdout.lock()).context("Failed to print history")?;
    }

    let objects_dir = store
        .objects_dir()
        .map(PathBuf::from)
        .context("Object store has no directory to watch")?;

    let options = SessionOptions {
        delivery: config.delivery,
        decode: config.decode_options(),
        read_timeout: config.read_timeout(),
        send_timeout: config.send_timeout(),
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(async move {
        let (transport, transport_events) = WebSocketTransport::connect(&cli.endpoint).await?;

        // Registered before the snapshot so objects written meanwhile are not missed
        let (_watcher, changes) = watch_objects(&objects_dir, config.event_buffer)?;

        let session = SyncSession::new(Arc::new(Mutex::new(store)), transport, options);
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let end = session.run(changes, transport_events, shutdown).await?;
        tracing::info!("Session ended: {:?}", end);
        Ok::<_, anyhow::Error>(end.is_graceful())
    })
}
