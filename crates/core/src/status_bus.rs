//! Status bus: a redis-backed cache of the latest status per node plus a
//! pub/sub channel that fans out live updates to anything watching (the
//! admin HTTP layer, in particular). The cache has no TTL — a node's last
//! known status should still be readable after the publishing client has
//! gone quiet, since that silence is itself the fact worth showing.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::errors::{CoreError, CoreResult};

pub const STATUS_CHANNEL: &str = "mqtt_status";

fn status_key(node_id: &str) -> String {
    format!("node/{node_id}/status")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    StatusUpdate {
        node_id: String,
        state: String,
        previous_state: String,
        state_entered_at: String,
        messages_last_60s: u32,
        messages_total: u64,
        connect_attempts: u64,
        connect_success: u64,
        connect_fail: u64,
        errors: u64,
        last_error: Option<String>,
    },
    MessageReceived {
        node_id: String,
        topic: String,
        timestamp: String,
        geometry: Option<serde_json::Value>,
    },
}

/// Everything a `publish_status` call needs to build one status snapshot.
/// Borrowed rather than owned since every field is formatted from
/// caller-side state that already lives on the stack.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot<'a> {
    pub node_id: &'a str,
    pub state: &'a str,
    pub previous_state: &'a str,
    pub state_entered_at: &'a str,
    pub messages_last_60s: u32,
    pub messages_total: u64,
    pub connect_attempts: u64,
    pub connect_success: u64,
    pub connect_fail: u64,
    pub errors: u64,
    pub last_error: Option<&'a str>,
}

/// Publishes status/message events and maintains the no-TTL status cache.
/// Publish calls are throttled per-node independently for the two message
/// kinds, matching the distinct cadences status snapshots and live message
/// fan-out need.
pub struct StatusBus {
    conn: redis::aio::ConnectionManager,
    status_throttle: Duration,
    message_throttle: Duration,
    last_status: Mutex<std::collections::HashMap<String, Instant>>,
    last_message: Mutex<std::collections::HashMap<String, Instant>>,
}

impl StatusBus {
    pub async fn connect(
        redis_url: &str,
        status_throttle: Duration,
        message_throttle: Duration,
    ) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::ConnectFailed(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("redis connect failed: {e}")))?;

        Ok(Self {
            conn,
            status_throttle,
            message_throttle,
            last_status: Mutex::new(std::collections::HashMap::new()),
            last_message: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Write the node's latest status to the cache and publish it, subject
    /// to the status throttle. Cache writes always happen; only the publish
    /// is throttled, so late subscribers still see a fresh snapshot. Pass
    /// `force = true` on a state transition — those publish unconditionally
    /// regardless of the throttle window, per the "always on state change"
    /// rule.
    pub async fn publish_status(&self, snapshot: &StatusSnapshot<'_>, force: bool) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let msg = BusMessage::StatusUpdate {
            node_id: snapshot.node_id.to_string(),
            state: snapshot.state.to_string(),
            previous_state: snapshot.previous_state.to_string(),
            state_entered_at: snapshot.state_entered_at.to_string(),
            messages_last_60s: snapshot.messages_last_60s,
            messages_total: snapshot.messages_total,
            connect_attempts: snapshot.connect_attempts,
            connect_success: snapshot.connect_success,
            connect_fail: snapshot.connect_fail,
            errors: snapshot.errors,
            last_error: snapshot.last_error.map(String::from),
        };
        let payload = serde_json::to_string(&msg)
            .map_err(|e| CoreError::DecodeFailed(format!("status serialize failed: {e}")))?;

        let _: () = conn
            .set(status_key(snapshot.node_id), &payload)
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("status cache write failed: {e}")))?;

        let due = self.should_emit(&self.last_status, snapshot.node_id, self.status_throttle).await;
        if force || due {
            self.last_status
                .lock()
                .await
                .insert(snapshot.node_id.to_string(), Instant::now());
            let _: i64 = conn
                .publish(STATUS_CHANNEL, &payload)
                .await
                .map_err(|e| CoreError::ConnectFailed(format!("status publish failed: {e}")))?;
        }
        Ok(())
    }

    /// Publish a message-received event, subject to the message throttle.
    /// Unlike status, there is no cache entry — this is a pure live feed.
    /// `geometry` carries the station's point when the caller has it to
    /// hand; it is optional in the wire format since the sampled feed is a
    /// visual convenience, not something consumers resolve against.
    pub async fn publish_message_received(
        &self,
        node_id: &str,
        topic: &str,
        timestamp: &str,
        geometry: Option<serde_json::Value>,
    ) -> CoreResult<()> {
        if !self.should_emit(&self.last_message, node_id, self.message_throttle).await {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let msg = BusMessage::MessageReceived {
            node_id: node_id.to_string(),
            topic: topic.to_string(),
            timestamp: timestamp.to_string(),
            geometry,
        };
        let payload = serde_json::to_string(&msg)
            .map_err(|e| CoreError::DecodeFailed(format!("message serialize failed: {e}")))?;

        let _: i64 = conn
            .publish(STATUS_CHANNEL, &payload)
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("message publish failed: {e}")))?;
        Ok(())
    }

    /// Read the cached status snapshot for a single node, if present.
    pub async fn get_status(&self, node_id: &str) -> CoreResult<Option<BusMessage>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(status_key(node_id))
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("status cache read failed: {e}")))?;

        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| CoreError::DecodeFailed(format!("status cache decode failed: {e}")))
        })
        .transpose()
    }

    async fn should_emit(
        &self,
        table: &Mutex<std::collections::HashMap<String, Instant>>,
        node_id: &str,
        throttle: Duration,
    ) -> bool {
        let mut table = table.lock().await;
        let now = Instant::now();
        match table.get(node_id) {
            Some(last) if now.duration_since(*last) < throttle => false,
            _ => {
                table.insert(node_id.to_string(), now);
                true
            }
        }
    }
}
