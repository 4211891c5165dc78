//! Colloquy server - HTTP front end for the chat pipeline

use anyhow::{Context, Result};
use clap::Parser;
use colloquy_core::persistence;
use colloquy_core::prelude::*;
use colloquy_server::{AppState, router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(about = "Conversational orchestration server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to colloquy.toml and COLLOQUY_* variables)
    #[arg(short, long, env = "COLLOQUY_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = match &cli.config {
        Some(path) => ColloquyConfig::from_file(path)?,
        None => ColloquyConfig::load()?,
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let storage = persistence::from_config(&config.persistence, clock.clone())
        .await
        .context("failed to open session persistence")?;
    let sweep_interval = config.session.sweep_interval;
    let bind = config.server.bind;

    let pipeline = Arc::new(
        ChatPipeline::builder(config)
            .clock(clock.clone())
            .persistence(storage)
            .build()?,
    );
    let feedback = Arc::new(FeedbackLog::new(clock));

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_sessions(
        pipeline.clone(),
        sweep_interval,
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    tracing::info!("Colloquy {} listening on http://{}", colloquy_core::VERSION, bind);

    let app = router(AppState::new(pipeline, feedback));
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutting down");
                    server_shutdown.cancel();
                }
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!("Sweeper task failed: {}", e);
    }

    Ok(())
}

/// Periodically drop idle sessions and expired snapshots until cancelled
async fn sweep_sessions(pipeline: Arc<ChatPipeline>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = pipeline.sweep();
                if !removed.is_empty() {
                    tracing::debug!(count = removed.len(), "Swept idle sessions");
                }
                let purged = pipeline.purge_expired_snapshots().await;
                if purged > 0 {
                    tracing::debug!(count = purged, "Purged expired session snapshots");
                }
            }
        }
    }
}
