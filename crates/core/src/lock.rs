//! Distributed ownership locking over redis.
//!
//! Each supervisor instance tries to claim exclusive ownership of a node's
//! MQTT session before starting a client for it, so that two supervisor
//! processes never subscribe the same WIS2 node twice. The lock carries a
//! TTL and must be periodically refreshed by its owner; a break policy
//! governs what another instance is allowed to do when an owner goes quiet.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};

/// Governs whether an instance may steal a lock from another live owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockBreakPolicy {
    /// Never break a lock held by another instance, even past its TTL.
    Never,
    /// Only acquire once the key has actually expired in redis.
    #[default]
    OnTtlExpiredOnly,
    /// Overwrite any existing lock unconditionally.
    Aggressive,
}

fn lock_key(node_id: &str) -> String {
    format!("node/{node_id}/lock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockValue {
    owner_instance_id: String,
    acquired_at: i64,
    refreshed_at: i64,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Claims and refreshes per-node ownership locks on behalf of this process.
#[derive(Clone)]
pub struct OwnershipLocker {
    conn: redis::aio::ConnectionManager,
    pub instance_id: String,
    ttl: Duration,
    policy: LockBreakPolicy,
}

impl OwnershipLocker {
    pub async fn connect(redis_url: &str, ttl: Duration, policy: LockBreakPolicy) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::ConnectFailed(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("redis connect failed: {e}")))?;

        Ok(Self {
            conn,
            instance_id: Uuid::new_v4().to_string(),
            ttl,
            policy,
        })
    }

    async fn read(&self, key: &str) -> CoreResult<Option<LockValue>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("lock read failed: {e}")))?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| CoreError::ConnectFailed(format!("lock value decode failed: {e}")))
        })
        .transpose()
    }

    async fn write(&self, key: &str, value: &LockValue) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)
            .map_err(|e| CoreError::ConnectFailed(format!("lock value encode failed: {e}")))?;
        let _: () = conn
            .set_ex(key, payload, self.ttl.as_secs())
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("lock write failed: {e}")))?;
        Ok(())
    }

    /// Attempt to acquire ownership of `node_id`. Returns `true` if this
    /// instance now owns the lock.
    ///
    /// If the key is absent, it is claimed fresh. If it is present and
    /// already owned by this instance, the acquire is reentrant (its TTL is
    /// refreshed, `acquired_at` preserved). If it is owned by another
    /// instance, whether it can be broken depends on `policy`: `Never`
    /// refuses, `OnTtlExpiredOnly` relies on redis's own key expiry (a
    /// conditional `SET NX` fails while the key is still live), and
    /// `Aggressive` overwrites unconditionally.
    pub async fn acquire(&self, node_id: &str) -> CoreResult<bool> {
        let key = lock_key(node_id);
        let now = now_unix();

        if let Some(current) = self.read(&key).await? {
            if current.owner_instance_id == self.instance_id {
                self.write(
                    &key,
                    &LockValue {
                        owner_instance_id: self.instance_id.clone(),
                        acquired_at: current.acquired_at,
                        refreshed_at: now,
                    },
                )
                .await?;
                return Ok(true);
            }
            if self.policy == LockBreakPolicy::Aggressive {
                self.write(
                    &key,
                    &LockValue {
                        owner_instance_id: self.instance_id.clone(),
                        acquired_at: now,
                        refreshed_at: now,
                    },
                )
                .await?;
                return Ok(true);
            }
        }

        let value = LockValue {
            owner_instance_id: self.instance_id.clone(),
            acquired_at: now,
            refreshed_at: now,
        };
        let payload = serde_json::to_string(&value)
            .map_err(|e| CoreError::ConnectFailed(format!("lock value encode failed: {e}")))?;

        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::ConnectFailed(format!("lock acquire failed: {e}")))?;

        if set.is_some() {
            return Ok(true);
        }

        match self.policy {
            LockBreakPolicy::Never | LockBreakPolicy::OnTtlExpiredOnly => {
                // NX failed: the key still exists (not yet TTL-expired) and
                // is owned by someone else, handled above for `Aggressive`.
                Ok(false)
            }
            LockBreakPolicy::Aggressive => {
                self.write(&key, &value).await?;
                Ok(true)
            }
        }
    }

    /// Refresh this instance's lock TTL, preserving `acquired_at`. Returns
    /// `false` (ownership lost) if another instance now holds it.
    pub async fn refresh(&self, node_id: &str) -> CoreResult<bool> {
        let key = lock_key(node_id);
        match self.read(&key).await? {
            Some(current) if current.owner_instance_id == self.instance_id => {
                self.write(
                    &key,
                    &LockValue {
                        owner_instance_id: self.instance_id.clone(),
                        acquired_at: current.acquired_at,
                        refreshed_at: now_unix(),
                    },
                )
                .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release the lock, only if this instance still owns it.
    pub async fn release(&self, node_id: &str) -> CoreResult<()> {
        let key = lock_key(node_id);
        if let Some(current) = self.read(&key).await? {
            if current.owner_instance_id == self.instance_id {
                let mut conn = self.conn.clone();
                let _: () = conn
                    .del(&key)
                    .await
                    .map_err(|e| CoreError::ConnectFailed(format!("lock release failed: {e}")))?;
            }
        }
        Ok(())
    }

    /// True if this instance currently owns the lock for `node_id`.
    pub async fn owns(&self, node_id: &str) -> CoreResult<bool> {
        let key = lock_key(node_id);
        Ok(self
            .read(&key)
            .await?
            .map(|v| v.owner_instance_id == self.instance_id)
            .unwrap_or(false))
    }
}
