use std::path::PathBuf;

use clap::Parser;
use veilcast::config::Config;
use veilcast::server;
use veilcast::session::SessionManager;
use veilcast::store::ChunkStore;

#[derive(Parser)]
#[command(name = "veilcast-server")]
#[command(about = "Realtime end-to-end-encrypted content-sharing broker")]
struct Cli {
    /// Path to a TOML config file, merged over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on; overrides the config file and environment.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::load_from(cli.config.as_deref()).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to load configuration, using defaults");
        Config::default()
    });

    if let Some(port) = cli.port {
        config.port = port;
    }

    let store = match ChunkStore::open(
        PathBuf::from(&config.storage_path),
        config.large_file_threshold,
        config.max_pinned_items_per_session,
    ) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("failed to open chunk store: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = store.fix_large_file_metadata().await {
        tracing::warn!(error = %err, "large-file metadata migration failed");
    }

    let sessions = SessionManager::new();
    server::spawn_background_tasks(config.clone(), sessions.clone(), store.clone());

    let app = server::build_router(&config, sessions, store);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {addr}: {err}");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "veilcast-server listening");

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server exited with error");
    }
}
