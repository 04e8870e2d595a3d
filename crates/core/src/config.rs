//! Runtime settings (env vars) and the node-seed TOML file.
//!
//! Datasets and stations are never seeded from TOML — they arrive only
//! through the catalogue synchroniser, since they are fleet-managed
//! metadata rather than local configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;

use crate::db::{Db, NodeConfig};

// ---------------------------------------------------------------------------
// Env-derived settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub admin_bind_addr: IpAddr,
    pub admin_port: u16,

    pub lock_ttl_sec: u64,
    pub lock_refresh_sec: u64,

    pub batch_size: usize,
    pub batch_age_ms: u64,

    pub ws_throttle_ms: u64,
    pub status_throttle_ms: u64,

    pub health_silence_min: i64,
    pub health_connecting_min: i64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "sqlite:wis2watch.db?mode=rwc"),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            admin_bind_addr: env_parse_or("ADMIN_BIND_ADDR", IpAddr::from([0, 0, 0, 0])),
            admin_port: env_parse_or("ADMIN_PORT", 8090),

            lock_ttl_sec: env_parse_or("LOCK_TTL_SEC", 600),
            lock_refresh_sec: env_parse_or("LOCK_REFRESH_SEC", 240),

            batch_size: env_parse_or("BATCH_SIZE", 50),
            batch_age_ms: env_parse_or("BATCH_AGE_MS", 5000),

            ws_throttle_ms: env_parse_or("WS_THROTTLE_MS", 500),
            status_throttle_ms: env_parse_or("STATUS_THROTTLE_MS", 10_000),

            health_silence_min: env_parse_or("HEALTH_SILENCE_MIN", 10),
            health_connecting_min: env_parse_or("HEALTH_CONNECTING_MIN", 2),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Node seed file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEntry {
    pub node_id: String,
    pub name: String,
    #[serde(default)]
    pub centre_id: String,

    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_tls: bool,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,

    pub discovery_metadata_url: String,
    pub stations_url: String,

    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_true() -> bool {
    true
}

/// Load the node-seed TOML from `path`.
pub fn load(path: &str) -> Result<SeedFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file '{path}'"))?;
    let seed: SeedFile =
        toml::from_str(&raw).with_context(|| format!("failed to parse seed file '{path}'"))?;
    Ok(seed)
}

/// Upsert every node in the seed file into the database.
pub async fn apply(seed: &SeedFile, db: &Db) -> Result<()> {
    for n in &seed.nodes {
        db.upsert_node(&NodeConfig {
            node_id: n.node_id.clone(),
            name: n.name.clone(),
            centre_id: n.centre_id.clone(),
            mqtt_host: n.mqtt_host.clone(),
            mqtt_port: n.mqtt_port as i64,
            mqtt_tls: n.mqtt_tls,
            mqtt_username: n.mqtt_username.clone(),
            mqtt_password: n.mqtt_password.clone(),
            discovery_metadata_url: n.discovery_metadata_url.clone(),
            stations_url: n.stations_url.clone(),
            verify_ssl: n.verify_ssl,
            active: n.active,
        })
        .await
        .with_context(|| format!("failed to upsert seeded node '{}'", n.node_id))?;
    }

    tracing::info!(nodes = seed.nodes.len(), "node seed file applied");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_seed() {
        let toml = r#"
            [[nodes]]
            node_id = "node-a"
            name = "Node A"
            mqtt_host = "mqtt.example.org"
            discovery_metadata_url = "https://example.org/discovery"
            stations_url = "https://example.org/stations"
        "#;
        let seed: SeedFile = toml::from_str(toml).unwrap();
        assert_eq!(seed.nodes.len(), 1);
        assert_eq!(seed.nodes[0].mqtt_port, 1883);
        assert!(seed.nodes[0].verify_ssl);
        assert!(seed.nodes[0].active);
        assert_eq!(seed.nodes[0].centre_id, "");
    }

    #[test]
    fn parse_empty_seed() {
        let seed: SeedFile = toml::from_str("").unwrap();
        assert!(seed.nodes.is_empty());
    }

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let toml = r#"
            [[nodes]]
            node_id = "node-a"
            name = "Node A"
            mqtt_host = "mqtt.example.org"
            mqtt_port = 8883
            mqtt_tls = true
            discovery_metadata_url = "https://example.org/discovery"
            stations_url = "https://example.org/stations"
            active = false
        "#;
        let seed: SeedFile = toml::from_str(toml).unwrap();
        apply(&seed, &db).await.unwrap();

        let nodes = db.load_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "node-a");
        assert_eq!(nodes[0].mqtt_port, 8883);
        assert!(nodes[0].mqtt_tls);
        assert!(!nodes[0].active);
    }
}
