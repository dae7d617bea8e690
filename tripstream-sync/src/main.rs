use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tripstream_core::{DeviceId, SyncKind};
use tripstream_sync::api::{self, AppState};
use tripstream_sync::config::{
    Config, SchedulerConfig, ServerConfig, StorageConfig, UpstreamConfig,
};
use tripstream_sync::extract::TripThresholds;
use tripstream_sync::orchestrator::{SyncConfig, SyncOrchestrator};
use tripstream_sync::ratelimit::RateLimitConfig;
use tripstream_sync::storage::{
    CheckpointStore, PositionStore, RateLimitStore, TripStore, memory::MemoryStorage,
    sqlite::SqliteStorage,
};
use tripstream_sync::upstream::{UpstreamProvider, http::HttpProvider, mock::MockProvider};

#[derive(Parser)]
#[command(name = "tripstream-sync")]
#[command(about = "Fleet trip extraction and sync service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tripstream-sync.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,tripstream_sync=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(http_addr = %config.server.http_addr, "Starting server");

    let Config {
        server,
        storage,
        upstream,
        scheduler,
        sync,
        thresholds,
        ratelimit,
    } = config;

    match storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            let storage = MemoryStorage::default();
            run_with_provider(upstream, storage, server, scheduler, sync, thresholds, ratelimit)
                .await?;
        }
        StorageConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite storage");
            let storage = SqliteStorage::new(&path).await?;
            run_with_provider(upstream, storage, server, scheduler, sync, thresholds, ratelimit)
                .await?;
        }
    }

    Ok(())
}

async fn run_with_provider<S>(
    upstream: UpstreamConfig,
    storage: S,
    server: ServerConfig,
    scheduler: SchedulerConfig,
    sync: SyncConfig,
    thresholds: TripThresholds,
    ratelimit: RateLimitConfig,
) -> color_eyre::Result<()>
where
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    match upstream {
        UpstreamConfig::Mock => {
            info!("Using mock upstream provider");
            let provider = MockProvider::default();
            run_server(provider, storage, server, scheduler, sync, thresholds, ratelimit).await
        }
        UpstreamConfig::Http {
            base_url,
            token,
            utc_offset_minutes,
        } => {
            info!(base_url = %base_url, "Using HTTP upstream provider");
            let provider = HttpProvider::new(base_url, token, utc_offset_minutes);
            run_server(provider, storage, server, scheduler, sync, thresholds, ratelimit).await
        }
    }
}

async fn run_server<P, S>(
    provider: P,
    storage: S,
    server: ServerConfig,
    scheduler: SchedulerConfig,
    sync: SyncConfig,
    thresholds: TripThresholds,
    ratelimit: RateLimitConfig,
) -> color_eyre::Result<()>
where
    P: UpstreamProvider,
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    let orchestrator = Arc::new(SyncOrchestrator::new(
        provider,
        storage.clone(),
        sync,
        thresholds,
        ratelimit,
    ));

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
        storage,
    };
    let app = api::router().with_state(state);

    let cancel = CancellationToken::new();

    if scheduler.enabled {
        tokio::spawn(scheduler_loop(
            Arc::clone(&orchestrator),
            scheduler,
            cancel.clone(),
        ));
    }

    let listener = TcpListener::bind(server.http_addr).await?;
    info!(http_addr = %server.http_addr, "HTTP server listening");

    let cancel_clone = cancel.clone();
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(async move {
            cancel_clone.cancelled().await;
        }) => {
            if let Err(e) = result {
                tracing::error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            cancel.cancel();
        }
    }

    Ok(())
}

/// Periodic incremental sync over the configured (or all known) devices.
async fn scheduler_loop<P, S>(
    orchestrator: Arc<SyncOrchestrator<P, S>>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) where
    P: UpstreamProvider,
    S: PositionStore + TripStore + CheckpointStore + RateLimitStore + Clone,
{
    let interval = Duration::from_secs(config.interval_secs);
    info!(interval_secs = config.interval_secs, "scheduler running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let devices: Vec<DeviceId> = config
            .device_ids
            .iter()
            .map(|id| DeviceId::new(id.as_str()))
            .collect();
        let report = orchestrator.sync_devices(devices, SyncKind::Incremental).await;
        if !report.success {
            warn!(
                run_id = %report.run_id.0,
                errors = report.errors.len(),
                "scheduled sync finished with errors"
            );
        }
    }
}
