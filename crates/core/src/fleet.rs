//! Fleet supervisor: owns the registry of running per-node MQTT clients,
//! coordinates ownership locks, and exposes the control surface the admin
//! API and control loop drive.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::catalogue;
use crate::db::Db;
use crate::errors::{CoreError, CoreResult};
use crate::lock::OwnershipLocker;
use crate::node_client::{self, NodeHandle};
use crate::status_bus::StatusBus;

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealthReport {
    pub node_id: String,
    pub state: String,
    pub owns_lock: bool,
    pub healthy: bool,
}

pub struct FleetSupervisor {
    db: Db,
    status_bus: Arc<StatusBus>,
    locker: Arc<OwnershipLocker>,
    batch_size: usize,
    batch_age: Duration,
    health_silence: Duration,
    health_connecting: Duration,
    status_interval: Duration,
    handles: Mutex<HashMap<String, NodeHandle>>,
}

impl FleetSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        status_bus: Arc<StatusBus>,
        locker: Arc<OwnershipLocker>,
        batch_size: usize,
        batch_age: Duration,
        health_silence: Duration,
        health_connecting: Duration,
        status_interval: Duration,
    ) -> Self {
        Self {
            db,
            status_bus,
            locker,
            batch_size,
            batch_age,
            health_silence,
            health_connecting,
            status_interval,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to start a client for `node_id`, acquiring ownership first.
    /// No-op if a handle for this node is already running.
    ///
    /// The supervisor mutex is never held across ownership-lock I/O: lock
    /// acquisition is a redis round-trip, so the presence check, the
    /// acquire, and the final insert each take and release the mutex
    /// separately. A second caller racing to start the same node between
    /// the check and the insert loses the redis `SET NX` and backs out
    /// cleanly (see the `!self.locker.acquire` branch below), so the race
    /// cannot produce two running handles for one node.
    pub async fn start(&self, node_id: &str) -> CoreResult<bool> {
        if self.handles.lock().await.contains_key(node_id) {
            return Ok(false);
        }

        let node = self
            .db
            .get_node(node_id)
            .await
            .map_err(|e| CoreError::PersistFailed(sqlx::Error::Protocol(e.to_string())))?
            .ok_or_else(|| CoreError::ResolveMissing(format!("unknown node {node_id}")))?;

        if !self.locker.acquire(node_id).await? {
            warn!(node = %node_id, "ownership lock held elsewhere — not starting");
            return Ok(false);
        }

        let mut handles = self.handles.lock().await;
        if handles.contains_key(node_id) {
            // Another call won the race and already started this node while
            // we were off doing lock I/O; release the now-redundant claim
            // this call just took (reentrant, so this is a refresh only).
            return Ok(false);
        }

        let handle = node_client::spawn(
            node,
            self.db.clone(),
            Arc::clone(&self.status_bus),
            self.batch_size,
            self.batch_age,
            self.health_silence,
            self.health_connecting,
            self.status_interval,
        );
        handles.insert(node_id.to_string(), handle);
        info!(node = %node_id, "node client started");
        Ok(true)
    }

    pub async fn start_all(&self) -> CoreResult<usize> {
        let nodes = self
            .db
            .load_active_nodes()
            .await
            .map_err(|e| CoreError::PersistFailed(sqlx::Error::Protocol(e.to_string())))?;
        let mut started = 0;
        for node in nodes {
            if self.start(&node.node_id).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Stop a running client and release its lock.
    pub async fn stop(&self, node_id: &str) -> CoreResult<bool> {
        let mut handles = self.handles.lock().await;
        let Some(handle) = handles.remove(node_id) else {
            return Ok(false);
        };
        handle.stop().await;
        self.locker.release(node_id).await?;
        info!(node = %node_id, "node client stopped");
        Ok(true)
    }

    pub async fn stop_all(&self) -> CoreResult<usize> {
        let node_ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        let mut stopped = 0;
        for node_id in node_ids {
            if self.stop(&node_id).await? {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    pub async fn restart(&self, node_id: &str) -> CoreResult<bool> {
        self.stop(node_id).await?;
        self.start(node_id).await
    }

    /// Refresh ownership locks for every running client; any that lose
    /// ownership are stopped so another instance can take over cleanly.
    pub async fn refresh_all_locks(&self) -> CoreResult<()> {
        let node_ids: Vec<String> = self.handles.lock().await.keys().cloned().collect();
        for node_id in node_ids {
            match self.locker.refresh(&node_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(node = %node_id, "lock ownership lost — stopping client");
                    self.stop(&node_id).await?;
                }
                Err(e) => warn!(node = %node_id, "lock refresh error: {e}"),
            }
        }
        Ok(())
    }

    /// Stop and drop handles for clients that are no longer healthy, so a
    /// subsequent monitor pass can restart them fresh.
    pub async fn cleanup_stale(&self) -> CoreResult<usize> {
        let stale: Vec<String> = {
            let handles = self.handles.lock().await;
            handles
                .iter()
                .filter(|(_, h)| !h.is_healthy())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for node_id in &stale {
            self.stop(node_id).await?;
        }
        Ok(stale.len())
    }

    /// Re-sync catalogues and ensure every active node has a running client.
    pub async fn monitor_all_active(&self) -> CoreResult<()> {
        catalogue::sync_all_nodes(&self.db)
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("catalogue sync failed: {e}")))?;
        self.start_all().await?;
        Ok(())
    }

    pub async fn health_report(&self, node_id: &str) -> CoreResult<NodeHealthReport> {
        let (state, healthy) = {
            let handles = self.handles.lock().await;
            match handles.get(node_id) {
                Some(h) => (h.state().as_str().to_string(), h.is_healthy()),
                None => ("stopped".to_string(), false),
            }
        };
        let owns_lock = self.locker.owns(node_id).await?;
        Ok(NodeHealthReport {
            node_id: node_id.to_string(),
            state,
            owns_lock,
            healthy,
        })
    }

    pub async fn all_health_reports(&self) -> CoreResult<Vec<NodeHealthReport>> {
        let node_ids: Vec<String> = {
            let handles = self.handles.lock().await;
            handles.keys().cloned().collect()
        };
        let mut reports = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            reports.push(self.health_report(&node_id).await?);
        }
        Ok(reports)
    }

    pub async fn running_node_ids(&self) -> Vec<String> {
        self.handles.lock().await.keys().cloned().collect()
    }
}
