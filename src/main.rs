use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use bundlehub::assembler::Assembler;
use bundlehub::config::{self, Config};
use bundlehub::http::{self, AppState};
use bundlehub::store;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "bundlehub", about = "Policy bundle assembler and store")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults apply when
    /// omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve bundles over HTTP (`PUT`/`GET /bundles/{name}`).
    Store,
    /// Periodically package the configured sources and publish them.
    Assemble {
        /// Run a single build cycle and exit.
        #[arg(long)]
        once: bool,
    },
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

async fn run_store(config: &Config) -> Result<()> {
    let backend = store::build_store(&config.store).await?;
    let state = AppState::new(backend, config.store.max_bundle_bytes);
    http::run_http_server(&config.store.listen, state, shutdown_signal()).await
}

async fn run_assembler(config: &Config, once: bool) -> Result<()> {
    let assembler = Assembler::from_config(&config.assembler)?;
    tracing::info!(
        store_url = %config.assembler.store_url,
        bundle = %config.assembler.bundle_name,
        interval_secs = config.assembler.interval_secs,
        "bundle assembler configured"
    );

    if once {
        let report = assembler
            .build_once()
            .await
            .context("bundle build failed")?;
        tracing::info!(
            bundle = %report.bundle,
            entries = ?report.entries,
            bytes = report.artifact_bytes,
            response = %report.ack.message,
            "bundle build complete"
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    assembler.run(cancel).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::parse_config("")?,
    };

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command {
        Command::Store => run_store(&config).await?,
        Command::Assemble { once } => run_assembler(&config, once).await?,
    }

    tracing::info!("bundlehub shut down cleanly");
    Ok(())
}
