//! Background expiry of routes whose registrations stopped being refreshed.

use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::UpdaterError;
use crate::updater::UpdaterHandle;

/// Periodically asks the updater to drop stale routes.
///
/// Only fails when the updater has stopped.
pub async fn run_route_pruner(
    updater: UpdaterHandle,
    check_interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), UpdaterError> {
    let mut interval = time::interval(check_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    // Prevent immediately ticking when spawned
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = interval.tick() => {}
        }

        if let Err(err) = updater.prune_stale_routes().await {
            tracing::error!(error = %err, "route pruner stopping");
            return Err(err);
        }
    }
}
