// =============================================================================
// Runner Service — strategy execution against the data-service bus
// =============================================================================

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use barflow::config::{RealtimeConfig, Workdir};
use barflow::runner_service::runner::RunnerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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
        script = %config.realtime.script_name,
        bus = %config.bus_url(),
        "runner service starting"
    );

    // Missing script or empty script_name is fatal here.
    let service = RunnerService::new(config, &workdir)?;

    tokio::select! {
        _ = service.run() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping");
        }
    }
    Ok(())
}
