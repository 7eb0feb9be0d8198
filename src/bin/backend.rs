#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tutortube::{
    api::{self, AppState},
    config::{DEFAULT_CONFIG_PATH, RuntimeConfig, load_runtime_config_from},
    frames::FrameExtractor,
    storage::MediaStorage,
    store::VideoStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the tutorial video API.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
    config: PathBuf,
    #[arg(long = "host", value_name = "ADDR", help = "Override the listen address")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Override the listen port")]
    port: Option<u16>,
    #[arg(
        long = "static-root",
        value_name = "PATH",
        help = "Directory holding uploaded videos and preview frames"
    )]
    static_root: Option<PathBuf>,
    #[arg(long = "database", value_name = "PATH", help = "SQLite database file")]
    database: Option<PathBuf>,
}

impl Cli {
    fn apply(self, mut config: RuntimeConfig) -> RuntimeConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(static_root) = self.static_root {
            config.static_root = static_root;
        }
        if let Some(database) = self.database {
            config.database_path = database;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutortube=info,backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let config = cli.apply(load_runtime_config_from(&config_path)?);
    tracing::info!(
        config = %config_path.display(),
        static_root = %config.static_root.display(),
        database = %config.database_path.display(),
        "loaded configuration"
    );

    let storage = MediaStorage::new(&config.static_root);
    storage.prepare()?;
    let store = VideoStore::open(&config.database_path).context("initializing video store")?;
    let frames = FrameExtractor::new(&config.ffmpeg_bin, &config.ffprobe_bin);

    let state = AppState::new(store, storage, frames, config.max_upload_bytes);
    let app = api::router(state);

    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing listen address {}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}
