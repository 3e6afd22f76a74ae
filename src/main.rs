//! # indexserve CLI
//!
//! Opens (or creates) an index and serves it on the configured address.
//!
//! ## Usage
//!
//! ```bash
//! indexserve <INDEX> [--config ./indexserve.toml] [--load docs.jsonl]
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use indexserve::config::{self, Config};
use indexserve::index::SqliteIndex;
use indexserve::server;

/// Serve a full-text JSON index over HTTP.
///
/// Queries are POSTed as the raw request body; matches come back as a
/// streamed JSON array.
#[derive(Parser)]
#[command(name = "indexserve", version)]
struct Cli {
    /// Path to the index file. Created if it does not exist.
    index: PathBuf,

    /// Path to a TOML configuration file. Defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Newline-delimited JSON documents to add before serving.
    #[arg(long)]
    load: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("indexserve=info")),
        )
        .init();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    // open the index, create if missing
    let index = Arc::new(SqliteIndex::open(&cli.index, &cfg.index).await?);

    if let Some(path) = &cli.load {
        let loaded = index
            .load_jsonl(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?;
        info!(documents = loaded, "loaded {}", path.display());
    }

    println!(
        "Serving up {} at http://{}/",
        cli.index.display(),
        cfg.server.bind
    );

    let served = server::run_server(&cfg, index.clone(), shutdown_signal()).await;

    info!("shutting down");
    index.close().await;
    served
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler: serve until killed.
        std::future::pending::<()>().await;
    }
}
