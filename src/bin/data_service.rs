// =============================================================================
// Data Service — bar assembly, persistence, lifecycle events
// =============================================================================
//
// Four tasks share one process: trade collector, gap fixer, file updater,
// and the HTTP + WebSocket server. Configuration errors are fatal here;
// everything after startup retries forever.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barflow::cache::BarCache;
use barflow::config::{RealtimeConfig, Workdir};
use barflow::data_service::state::AppState;
use barflow::data_service::{api, collector, file_updater, gap_fixer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workdir = Workdir::resolve()?;
    let config = RealtimeConfig::load(workdir.config_path())?;

    if !config.realtime.enabled {
        warn!("realtime trading is disabled in the config — exiting");
        return Ok(());
    }

    info!(
        provider = %config.realtime.provider,
        exchange = %config.realtime.exchange,
        symbol = %config.realtime.symbol,
        timeframe = %config.realtime.timeframe,
        "data service starting"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let cache = Arc::new(BarCache::init(workdir.cache_path())?);
    let bind_addr = format!("{}:{}", config.service_host(), config.service_port());
    let app = Arc::new(AppState::new(config, workdir, cache));

    // ── 3. Trade collector ───────────────────────────────────────────────
    {
        let app = app.clone();
        tokio::spawn(async move {
            collector::collector_loop(app).await;
        });
    }

    // ── 4. Gap fixer ─────────────────────────────────────────────────────
    {
        let app = app.clone();
        tokio::spawn(async move {
            gap_fixer::gap_fixer_loop(app).await;
        });
    }

    // ── 5. File updater ──────────────────────────────────────────────────
    {
        let app = app.clone();
        tokio::spawn(async move {
            file_updater::FileUpdater::new(app).run().await;
        });
    }

    // ── 6. HTTP + WebSocket server ───────────────────────────────────────
    {
        let app = app.clone();
        tokio::spawn(async move {
            let router = api::router(app);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind_addr, "API server listening");
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    Ok(())
}
