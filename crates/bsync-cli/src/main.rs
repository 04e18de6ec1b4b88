mod client;
mod config;
mod http;
mod scheduler;
mod service;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bsync_core::DomainEvent;
use bsync_core::time::{millis_to_iso8601, now_iso8601};
use bsync_store::Store;
use clap::{Parser, Subcommand};
use rand::Rng;
use rand::distr::Alphanumeric;
use tokio_util::sync::CancellationToken;

use crate::client::HttpEngineClient;
use crate::config::{CONFIG_FILE, Config, DB_FILE, data_dir};
use crate::http::AppState;
use crate::scheduler::Intervals;
use crate::service::{ServiceOptions, SyncService};

const TOKEN_KEY: &str = "sync_token";

#[derive(Parser)]
#[command(name = "bsync", about = "Behavior sync service for AI analysis engines")]
struct Cli {
    /// Config file (default: $BSYNC_DATA_DIR/bsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP endpoints, batch dispatcher and health monitor
    Serve {
        /// Listen address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Queue one domain event given as JSON
    Enqueue {
        /// e.g. '{"action":"page_view","user_id":7}'
        event: String,
    },

    /// Dispatch one batch of queued events
    Flush {
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Probe every engine once
    Health,

    /// Show engine states and queue counts
    Status,

    /// Show a user's metric totals
    Metrics { user_id: u64 },

    /// Show a user's most recent insights
    Insights {
        user_id: u64,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the capture token, generating one if needed
    Token,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir().join(CONFIG_FILE));
    Config::load(&path)
}

fn open_store() -> Result<Store> {
    let dir = data_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Store::open(&dir.join(DB_FILE)).context("failed to open store")
}

fn build_service(config: &Config, store: Store) -> Result<SyncService> {
    let transport = Arc::new(HttpEngineClient::new().context("failed to build HTTP client")?);
    SyncService::new(
        store,
        config.engine_specs()?,
        transport,
        ServiceOptions::from(&config.dispatch),
    )
    .context("failed to start sync service")
}

/// The configured token, else the one persisted by an earlier run, else
/// a fresh random one that is persisted for next time.
fn ensure_sync_token(store: &Store, configured: Option<&str>) -> Result<String> {
    if let Some(token) = configured.filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }
    if let Some(token) = store.get_metadata(TOKEN_KEY)? {
        return Ok(token);
    }
    let token: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    store.set_metadata(TOKEN_KEY, &token)?;
    tracing::info!("generated a new sync token");
    Ok(token)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve { bind } => cmd_serve(&cli, bind.as_deref()).await,
        Commands::Enqueue { event } => cmd_enqueue(&cli, event).await,
        Commands::Flush { batch_size } => cmd_flush(&cli, *batch_size).await,
        Commands::Health => cmd_health(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Metrics { user_id } => cmd_metrics(&cli, *user_id).await,
        Commands::Insights { user_id, limit } => cmd_insights(&cli, *user_id, *limit).await,
        Commands::Token => cmd_token(&cli),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

async fn cmd_serve(cli: &Cli, bind: Option<&str>) -> Result<()> {
    let config = load_config(cli)?;
    let store = open_store()?;
    let token = ensure_sync_token(&store, config.sync_token.as_deref())?;
    let service = build_service(&config, store)?;

    let addr = bind.unwrap_or(config.bind.as_str());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let cancel = CancellationToken::new();
    let tasks = scheduler::spawn(
        service.clone(),
        Intervals {
            sync: config.dispatch.sync_interval(),
            health: config.dispatch.health_interval(),
        },
        cancel.clone(),
    );

    let app = http::build_router(AppState::new(service.clone(), &token));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("background task ended abnormally: {e}");
        }
    }
    service.drain().await;
    tracing::info!("stopped");
    Ok(())
}

async fn cmd_enqueue(cli: &Cli, json: &str) -> Result<()> {
    let event: DomainEvent = serde_json::from_str(json).context("invalid domain event")?;
    let config = load_config(cli)?;
    let service = build_service(&config, open_store()?)?;

    let receipt = service
        .enqueue(event.into_draft(&now_iso8601()))
        .await
        .context("failed to enqueue event")?;
    println!(
        "queued {} {} priority {} ({})",
        receipt.action,
        receipt.id,
        receipt.priority,
        if receipt.immediate {
            "immediate"
        } else {
            "batched"
        }
    );

    if receipt.immediate {
        service.drain().await;
        let counts = service.status().await?.persisted;
        println!(
            "queue: {} pending, {} processed, {} failed",
            counts.pending, counts.processed, counts.failed
        );
    }
    Ok(())
}

async fn cmd_flush(cli: &Cli, batch_size: Option<usize>) -> Result<()> {
    let config = load_config(cli)?;
    let service = build_service(&config, open_store()?)?;
    let report = service.flush(batch_size).await.context("flush failed")?;
    println!(
        "dispatched {}: {} delivered, {} retried, {} failed, {} deferred",
        report.dispatched, report.delivered, report.retried, report.failed, report.deferred
    );
    println!("{} left in queue", report.queue_size);
    Ok(())
}

async fn cmd_health(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let service = build_service(&config, open_store()?)?;
    service.health_check_all().await;
    for (engine, summary) in service.ai_status().await {
        let detail = summary.last_error.as_deref().unwrap_or("");
        println!(
            "{:<8} {:<10} {:.3}s {detail}",
            engine.as_str(),
            summary.state.as_str(),
            summary.response_time
        );
    }
    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let service = build_service(&config, open_store()?)?;
    let status = service.status().await?;

    println!("{:<8} {:<10} {:>6}  LAST ERROR", "ENGINE", "STATE", "ERRORS");
    for (engine, summary) in &status.engines {
        println!(
            "{:<8} {:<10} {:>6}  {}",
            engine.as_str(),
            summary.state.as_str(),
            summary.error_count,
            summary.last_error.as_deref().unwrap_or("-")
        );
    }
    println!("pending:   {}", status.persisted.pending);
    println!("processed: {}", status.persisted.processed);
    println!("failed:    {}", status.persisted.failed);
    Ok(())
}

async fn cmd_metrics(cli: &Cli, user_id: u64) -> Result<()> {
    let config = load_config(cli)?;
    let service = build_service(&config, open_store()?)?;
    let totals = service.user_metrics(user_id).await?;
    if totals.is_empty() {
        println!("(no metrics)");
        return Ok(());
    }
    for (group, metrics) in totals.by_group() {
        println!("{group}");
        for (name, value) in metrics {
            println!("  {name} = {value}");
        }
    }
    Ok(())
}

async fn cmd_insights(cli: &Cli, user_id: u64, limit: usize) -> Result<()> {
    let config = load_config(cli)?;
    let service = build_service(&config, open_store()?)?;
    let insights = service.user_insights(user_id, limit).await?;
    if insights.is_empty() {
        println!("(no insights)");
    }
    for insight in insights {
        println!(
            "{}  {:<8} confidence {:.2}  {}",
            millis_to_iso8601(insight.created_at),
            insight.engine.as_str(),
            insight.confidence,
            insight.payload
        );
    }
    Ok(())
}

fn cmd_token(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let store = open_store()?;
    println!("{}", ensure_sync_token(&store, config.sync_token.as_deref())?);
    Ok(())
}
