pub mod lifecycle;
pub mod status;

use std::sync::Arc;

use anyhow::Context;
use libruntime::cri::CriClient;
use tokio::select;
use tracing::{debug, info, warn};

use crate::config::Config;
use status::{
    cache::Cache,
    clock::RealClock,
    pleg::PLEG,
    pod::RuntimeManager,
};

pub fn main(config: Config) -> Result<(), anyhow::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

/// Dials the configured CRI endpoint.
pub async fn connect(config: &Config) -> anyhow::Result<Arc<CriClient>> {
    let client = CriClient::connect(config.cri_client_config())
        .await
        .with_context(|| format!("failed to connect to {}", config.runtime_endpoint))?;
    Ok(Arc::new(client))
}

/// Runs PLEG against the runtime until Ctrl-C, logging every event.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cri = connect(&config).await?;
    let runtime = Arc::new(RuntimeManager::try_new(cri.clone()).await?);
    info!(
        endpoint = %config.runtime_endpoint,
        runtime = %runtime.runtime_name(),
        "[daemon] Connected to container runtime"
    );

    let cache = Arc::new(Cache::new());
    let mut pleg = PLEG::new(
        runtime,
        Some(cache.clone()),
        Arc::new(RealClock),
        config.pleg_config(),
    );
    let mut events = pleg
        .watch()
        .context("PLEG event channel already taken")?;
    pleg.start();

    let period = config.health_check_interval();
    let mut health = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("[daemon] PLEG event channel closed");
                    break;
                };
                let (status, err) = cache.get(&event.id);
                info!(
                    pod_uid = %event.id,
                    pod_name = %status.name,
                    event_type = ?event.event_type,
                    container_id = ?event.data,
                    ips = ?status.ips,
                    status_error = ?err,
                    "[daemon] Pod lifecycle event"
                );
            }
            _ = health.tick() => {
                if pleg.healthy() {
                    debug!(last_relist = ?pleg.last_relist_time(), "[daemon] PLEG is healthy");
                } else {
                    warn!(last_relist = ?pleg.last_relist_time(), "[daemon] PLEG is unhealthy");
                }
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("[daemon] received Ctrl-C, shutting down");
                break;
            }
        }
    }

    pleg.stop();
    cri.cancellation_token().cancel();
    Ok(())
}
