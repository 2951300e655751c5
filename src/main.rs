use anyhow::{Context, Result};
use tracing::info;

use traffic_state_server::replay;
use traffic_state_server::types::SECOND_NS;
use traffic_state_server::{FcdKernel, MetricStore, RoadNetwork, ServerConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "traffic_state_server=info".into()),
        )
        .init();

    info!("🚦 Traffic State Estimation Server starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = ServerConfig::load(&config_path)?;
    info!("✓ Configuration loaded from {}", config_path);

    let network = RoadNetwork::from_file(&config.road_network_path)
        .context("a road network description is required to start")?;
    info!("✓ Road network loaded ({} connections)", network.len());

    let database_file = config.database_file();
    let store = MetricStore::open(
        &database_file,
        config.storage_backend,
        &network,
        config.is_persistent,
    )
    .with_context(|| format!("failed to open metric store at {}", database_file.display()))?;
    info!("✓ Metric store ready at {}", database_file.display());

    let mut kernel = FcdKernel::new(&config, network, store);

    let replay_stats = replay::replay_trace(&config.fcd_trace_path, &mut kernel)?;
    info!(
        "✓ Trace replayed: {} updates, {} records, {} malformed lines, {:.0} s simulated",
        replay_stats.updates,
        replay_stats.records,
        replay_stats.skipped_lines,
        replay_stats.last_time_ns as f64 / SECOND_NS as f64
    );

    kernel
        .shutdown(replay_stats.last_time_ns)
        .context("kernel shutdown failed")?;
    info!("🏁 Done");
    Ok(())
}
