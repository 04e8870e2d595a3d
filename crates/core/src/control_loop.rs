//! Background scheduler: four independent periodic jobs driving the fleet
//! supervisor. Each runs on its own ticker so a slow job never delays the
//! others.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::catalogue;
use crate::fleet::FleetSupervisor;

const MONITOR_ALL_ACTIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REFRESH_LOCKS_INTERVAL: Duration = Duration::from_secs(4 * 60);
const CLEANUP_STALE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Spawn the four control-loop jobs, returning their join handles so the
/// caller can monitor them alongside the rest of the daemon's tasks.
pub fn spawn_all(fleet: Arc<FleetSupervisor>, db: crate::db::Db) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        spawn_monitor_all_active(Arc::clone(&fleet)),
        spawn_refresh_locks(Arc::clone(&fleet)),
        spawn_cleanup_stale(Arc::clone(&fleet)),
        spawn_health_check(fleet, db),
    ]
}

fn spawn_monitor_all_active(fleet: Arc<FleetSupervisor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_ALL_ACTIVE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = fleet.monitor_all_active().await {
                error!("monitor_all_active failed: {e}");
            } else {
                info!("monitor_all_active complete");
            }
        }
    })
}

fn spawn_refresh_locks(fleet: Arc<FleetSupervisor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_LOCKS_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = fleet.refresh_all_locks().await {
                error!("refresh_all_locks failed: {e}");
            }
        }
    })
}

fn spawn_cleanup_stale(fleet: Arc<FleetSupervisor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_STALE_INTERVAL);
        loop {
            ticker.tick().await;
            match fleet.cleanup_stale().await {
                Ok(n) if n > 0 => info!(cleaned = n, "cleanup_stale removed dead clients"),
                Ok(_) => {}
                Err(e) => error!("cleanup_stale failed: {e}"),
            }
        }
    })
}

fn spawn_health_check(fleet: Arc<FleetSupervisor>, db: crate::db::Db) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = db.health_check().await {
                error!("database health check failed: {e}");
            }
            match fleet.all_health_reports().await {
                Ok(reports) => {
                    let unhealthy = reports.iter().filter(|r| !r.healthy).count();
                    if unhealthy > 0 {
                        info!(unhealthy, total = reports.len(), "health_check: unhealthy nodes present");
                    }
                }
                Err(e) => error!("health_check failed: {e}"),
            }

            // Independently probe each active node's discovery-metadata
            // endpoint, catching nodes whose broker is alive but whose
            // catalogue service is down (the MQTT health report alone
            // can't see that).
            match db.load_active_nodes().await {
                Ok(nodes) => {
                    for node in nodes {
                        if let Err(e) = catalogue::probe_node_health(&node).await {
                            warn!(node = %node.node_id, error = %e, "node health probe failed");
                        }
                    }
                }
                Err(e) => error!("loading active nodes for health probe failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_match_documented_cadences() {
        assert_eq!(MONITOR_ALL_ACTIVE_INTERVAL, Duration::from_secs(300));
        assert_eq!(REFRESH_LOCKS_INTERVAL, Duration::from_secs(240));
        assert_eq!(CLEANUP_STALE_INTERVAL, Duration::from_secs(600));
        assert_eq!(HEALTH_CHECK_INTERVAL, Duration::from_secs(300));
    }
}
