//! SQLite persistence layer (via sqlx): nodes, datasets, stations, station/
//! dataset membership, observations, and the sync-attempt audit trail.
//!
//! Uses runtime-checked `sqlx::query`/`query_as` with `.bind()` rather than
//! the compile-time-checked `query!` macro the teacher favors, since that
//! macro needs a live database (or a prepared offline cache) at build time.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Config / row structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub name: String,
    pub centre_id: String,
    pub mqtt_host: String,
    pub mqtt_port: i64,
    pub mqtt_tls: bool,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub discovery_metadata_url: String,
    pub stations_url: String,
    pub verify_ssl: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRow {
    pub node_id: String,
    pub name: String,
    pub centre_id: String,
    pub mqtt_host: String,
    pub mqtt_port: i64,
    pub mqtt_tls: bool,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub discovery_metadata_url: String,
    pub stations_url: String,
    pub verify_ssl: bool,
    pub active: bool,
    pub status: String,
    pub last_check: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatasetUpsert {
    pub node_id: String,
    pub identifier: String,
    pub title: String,
    pub wmo_data_policy: Option<String>,
    pub wmo_topic_hierarchy: String,
    pub self_link: Option<String>,
    pub collection_link: Option<String>,
    pub canonical_link: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetRow {
    pub id: i64,
    pub node_id: String,
    pub identifier: String,
    pub title: String,
    pub wmo_topic_hierarchy: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct StationUpsert {
    pub wigos_id: String,
    pub name: String,
    pub lon: f64,
    pub lat: f64,
    pub elevation: Option<f64>,
    pub facility_type: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationRow {
    pub id: i64,
    pub wigos_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ObservationInsert<'a> {
    pub message_id: &'a str,
    pub station_id: i64,
    pub dataset_id: i64,
    pub data_id: Option<&'a str>,
    pub publish_datetime: Option<String>,
    pub observation_datetime: String,
    pub canonical_link: Option<&'a str>,
    pub raw_json: String,
}

#[derive(Debug, Clone)]
pub struct SyncLogEntry<'a> {
    pub node_id: &'a str,
    pub sync_type: &'a str,
    pub status: &'a str,
    pub items_found: i64,
    pub items_created: i64,
    pub items_updated: i64,
    pub items_deleted: i64,
    pub error_message: Option<&'a str>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/wis2watch/wis2watch.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Nodes
    // ----------------------------

    pub async fn upsert_node(&self, n: &NodeConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
              node_id, name, centre_id,
              mqtt_host, mqtt_port, mqtt_tls, mqtt_username, mqtt_password,
              discovery_metadata_url, stations_url, verify_ssl, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
              name=excluded.name,
              centre_id=excluded.centre_id,
              mqtt_host=excluded.mqtt_host,
              mqtt_port=excluded.mqtt_port,
              mqtt_tls=excluded.mqtt_tls,
              mqtt_username=excluded.mqtt_username,
              mqtt_password=excluded.mqtt_password,
              discovery_metadata_url=excluded.discovery_metadata_url,
              stations_url=excluded.stations_url,
              verify_ssl=excluded.verify_ssl,
              active=excluded.active
            "#,
        )
        .bind(&n.node_id)
        .bind(&n.name)
        .bind(&n.centre_id)
        .bind(&n.mqtt_host)
        .bind(n.mqtt_port)
        .bind(n.mqtt_tls)
        .bind(&n.mqtt_username)
        .bind(&n.mqtt_password)
        .bind(&n.discovery_metadata_url)
        .bind(&n.stations_url)
        .bind(n.verify_ssl)
        .bind(n.active)
        .execute(&self.pool)
        .await
        .context("upsert_node failed")?;
        Ok(())
    }

    pub async fn load_nodes(&self) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query(
            r#"
            SELECT node_id, name, centre_id, mqtt_host, mqtt_port, mqtt_tls,
                   mqtt_username, mqtt_password, discovery_metadata_url,
                   stations_url, verify_ssl, active, status, last_check, last_error
            FROM nodes
            ORDER BY node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_nodes failed")?;

        Ok(rows.into_iter().map(row_to_node).collect())
    }

    /// Active nodes eligible for monitoring: `active = 1` and a non-empty
    /// `mqtt_host`, per the data model invariant that a host-less node is
    /// not a candidate for connection at all.
    pub async fn load_active_nodes(&self) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query(
            r#"
            SELECT node_id, name, centre_id, mqtt_host, mqtt_port, mqtt_tls,
                   mqtt_username, mqtt_password, discovery_metadata_url,
                   stations_url, verify_ssl, active, status, last_check, last_error
            FROM nodes
            WHERE active = 1 AND mqtt_host != ''
            ORDER BY node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_active_nodes failed")?;

        Ok(rows.into_iter().map(row_to_node).collect())
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeRow>> {
        let row = sqlx::query(
            r#"
            SELECT node_id, name, centre_id, mqtt_host, mqtt_port, mqtt_tls,
                   mqtt_username, mqtt_password, discovery_metadata_url,
                   stations_url, verify_ssl, active, status, last_check, last_error
            FROM nodes
            WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_node failed")?;

        Ok(row.map(row_to_node))
    }

    pub async fn set_node_status(
        &self,
        node_id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            "UPDATE nodes SET status = ?, last_check = ?, last_error = ? WHERE node_id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(last_error)
        .bind(node_id)
        .execute(&self.pool)
        .await
        .context("set_node_status failed")?;
        Ok(())
    }

    // ----------------------------
    // Datasets
    // ----------------------------

    /// Upsert a dataset by its unique URN identifier, returning its row id.
    pub async fn upsert_dataset(&self, d: &DatasetUpsert) -> Result<i64> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO datasets (
              node_id, identifier, title, wmo_data_policy, wmo_topic_hierarchy,
              self_link, collection_link, canonical_link, raw_json, status, last_synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)
            ON CONFLICT(identifier) DO UPDATE SET
              title=excluded.title,
              wmo_data_policy=excluded.wmo_data_policy,
              wmo_topic_hierarchy=excluded.wmo_topic_hierarchy,
              self_link=excluded.self_link,
              collection_link=excluded.collection_link,
              canonical_link=excluded.canonical_link,
              raw_json=excluded.raw_json,
              status='active',
              last_synced=excluded.last_synced
            "#,
        )
        .bind(&d.node_id)
        .bind(&d.identifier)
        .bind(&d.title)
        .bind(&d.wmo_data_policy)
        .bind(&d.wmo_topic_hierarchy)
        .bind(&d.self_link)
        .bind(&d.collection_link)
        .bind(&d.canonical_link)
        .bind(&d.raw_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("upsert_dataset failed")?;

        let row = sqlx::query("SELECT id FROM datasets WHERE identifier = ?")
            .bind(&d.identifier)
            .fetch_one(&self.pool)
            .await
            .context("upsert_dataset: fetch id failed")?;
        Ok(row.get::<i64, _>(0))
    }

    /// Mark every dataset for `node_id` not in `keep_identifiers` as `deleted`.
    /// Returns the number of rows marked.
    pub async fn mark_datasets_deleted_except(
        &self,
        node_id: &str,
        keep_identifiers: &[String],
    ) -> Result<u64> {
        let existing = sqlx::query("SELECT identifier FROM datasets WHERE node_id = ? AND status != 'deleted'")
            .bind(node_id)
            .fetch_all(&self.pool)
            .await
            .context("mark_datasets_deleted_except: load existing failed")?;

        let mut marked = 0u64;
        for row in existing {
            let identifier: String = row.get(0);
            if !keep_identifiers.contains(&identifier) {
                sqlx::query("UPDATE datasets SET status = 'deleted' WHERE identifier = ?")
                    .bind(&identifier)
                    .execute(&self.pool)
                    .await
                    .context("mark_datasets_deleted_except: update failed")?;
                marked += 1;
            }
        }
        Ok(marked)
    }

    pub async fn load_datasets_for_node(&self, node_id: &str) -> Result<Vec<DatasetRow>> {
        let rows = sqlx::query(
            "SELECT id, node_id, identifier, title, wmo_topic_hierarchy, status FROM datasets WHERE node_id = ? ORDER BY identifier",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .context("load_datasets_for_node failed")?;

        Ok(rows.into_iter().map(row_to_dataset).collect())
    }

    pub async fn get_dataset_by_topic(&self, topic: &str) -> Result<Option<DatasetRow>> {
        let row = sqlx::query(
            "SELECT id, node_id, identifier, title, wmo_topic_hierarchy, status FROM datasets WHERE wmo_topic_hierarchy = ?",
        )
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .context("get_dataset_by_topic failed")?;

        Ok(row.map(row_to_dataset))
    }

    /// Look up a dataset by its URN identifier, as referenced by a
    /// notification message's `metadata_id` field.
    pub async fn get_dataset_by_identifier(&self, identifier: &str) -> Result<Option<DatasetRow>> {
        let row = sqlx::query(
            "SELECT id, node_id, identifier, title, wmo_topic_hierarchy, status FROM datasets WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .context("get_dataset_by_identifier failed")?;

        Ok(row.map(row_to_dataset))
    }

    /// Active (non-deleted) topics for a node — used to derive MQTT subscriptions.
    pub async fn active_topics_for_node(&self, node_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT wmo_topic_hierarchy FROM datasets WHERE node_id = ? AND status = 'active'",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .context("active_topics_for_node failed")?;

        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    // ----------------------------
    // Stations
    // ----------------------------

    pub async fn upsert_station(&self, s: &StationUpsert) -> Result<i64> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO stations (
              wigos_id, name, lon, lat, elevation, facility_type, raw_json, last_synced
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(wigos_id) DO UPDATE SET
              name=excluded.name,
              lon=excluded.lon,
              lat=excluded.lat,
              elevation=excluded.elevation,
              facility_type=excluded.facility_type,
              raw_json=excluded.raw_json,
              last_synced=excluded.last_synced
            "#,
        )
        .bind(&s.wigos_id)
        .bind(&s.name)
        .bind(s.lon)
        .bind(s.lat)
        .bind(s.elevation)
        .bind(&s.facility_type)
        .bind(&s.raw_json)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("upsert_station failed")?;

        let row = sqlx::query("SELECT id FROM stations WHERE wigos_id = ?")
            .bind(&s.wigos_id)
            .fetch_one(&self.pool)
            .await
            .context("upsert_station: fetch id failed")?;
        Ok(row.get::<i64, _>(0))
    }

    /// Recompute a station's dataset membership to exactly `dataset_ids`.
    /// Stations are never deleted when absent from a sync — only their
    /// dataset membership is recomputed here.
    pub async fn set_station_datasets(&self, station_id: i64, dataset_ids: &[i64]) -> Result<()> {
        sqlx::query("DELETE FROM station_datasets WHERE station_id = ?")
            .bind(station_id)
            .execute(&self.pool)
            .await
            .context("set_station_datasets: clear failed")?;

        for dataset_id in dataset_ids {
            sqlx::query(
                "INSERT INTO station_datasets (station_id, dataset_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
            )
            .bind(station_id)
            .bind(dataset_id)
            .execute(&self.pool)
            .await
            .context("set_station_datasets: insert failed")?;
        }
        Ok(())
    }

    pub async fn get_station_by_wigos(&self, wigos_id: &str) -> Result<Option<StationRow>> {
        let row = sqlx::query("SELECT id, wigos_id, name FROM stations WHERE wigos_id = ?")
            .bind(wigos_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_station_by_wigos failed")?;

        Ok(row.map(|r| StationRow {
            id: r.get(0),
            wigos_id: r.get(1),
            name: r.get(2),
        }))
    }

    // ----------------------------
    // Observations
    // ----------------------------

    /// Idempotent insert keyed on (message_id, station_id). Returns `true` if
    /// a new row was created, `false` if it already existed.
    pub async fn insert_observation(&self, o: &ObservationInsert<'_>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO observations (
              message_id, station_id, dataset_id, data_id,
              publish_datetime, observation_datetime, canonical_link, raw_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id, station_id) DO NOTHING
            "#,
        )
        .bind(o.message_id)
        .bind(o.station_id)
        .bind(o.dataset_id)
        .bind(o.data_id)
        .bind(&o.publish_datetime)
        .bind(&o.observation_datetime)
        .bind(o.canonical_link)
        .bind(&o.raw_json)
        .execute(&self.pool)
        .await
        .context("insert_observation failed")?;

        Ok(result.rows_affected() > 0)
    }

    // ----------------------------
    // Sync log
    // ----------------------------

    pub async fn record_sync(&self, entry: &SyncLogEntry<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs (
              node_id, sync_type, status, items_found, items_created,
              items_updated, items_deleted, error_message, started_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.node_id)
        .bind(entry.sync_type)
        .bind(entry.status)
        .bind(entry.items_found)
        .bind(entry.items_created)
        .bind(entry.items_updated)
        .bind(entry.items_deleted)
        .bind(entry.error_message)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await
        .context("record_sync failed")?;
        Ok(())
    }

    /// Quick connectivity check — runs a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("db health check failed")?;
        Ok(())
    }
}

fn row_to_node(r: sqlx::sqlite::SqliteRow) -> NodeRow {
    NodeRow {
        node_id: r.get(0),
        name: r.get(1),
        centre_id: r.get(2),
        mqtt_host: r.get(3),
        mqtt_port: r.get(4),
        mqtt_tls: r.get(5),
        mqtt_username: r.get(6),
        mqtt_password: r.get(7),
        discovery_metadata_url: r.get(8),
        stations_url: r.get(9),
        verify_ssl: r.get(10),
        active: r.get(11),
        status: r.get(12),
        last_check: r.get(13),
        last_error: r.get(14),
    }
}

fn row_to_dataset(r: sqlx::sqlite::SqliteRow) -> DatasetRow {
    DatasetRow {
        id: r.get(0),
        node_id: r.get(1),
        identifier: r.get(2),
        title: r.get(3),
        wmo_topic_hierarchy: r.get(4),
        status: r.get(5),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node(id: &str) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            name: format!("Node {id}"),
            centre_id: "centre-1".into(),
            mqtt_host: "mqtt.example.org".into(),
            mqtt_port: 1883,
            mqtt_tls: false,
            mqtt_username: None,
            mqtt_password: None,
            discovery_metadata_url: "https://example.org/discovery".into(),
            stations_url: "https://example.org/stations".into(),
            verify_ssl: true,
            active: true,
        }
    }

    #[tokio::test]
    async fn upsert_and_load_node() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&sample_node("node-a")).await.unwrap();
        let nodes = db.load_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "node-a");
        assert_eq!(nodes[0].status, "disconnected");
    }

    #[tokio::test]
    async fn upsert_node_is_idempotent() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&sample_node("node-a")).await.unwrap();
        let mut updated = sample_node("node-a");
        updated.name = "Renamed".into();
        db.upsert_node(&updated).await.unwrap();

        let nodes = db.load_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Renamed");
    }

    #[tokio::test]
    async fn load_active_nodes_filters_inactive() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&sample_node("node-a")).await.unwrap();
        let mut inactive = sample_node("node-b");
        inactive.active = false;
        db.upsert_node(&inactive).await.unwrap();

        let active = db.load_active_nodes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, "node-a");
    }

    #[tokio::test]
    async fn load_active_nodes_excludes_empty_host() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&sample_node("node-a")).await.unwrap();
        let mut hostless = sample_node("node-b");
        hostless.mqtt_host = String::new();
        db.upsert_node(&hostless).await.unwrap();

        let active = db.load_active_nodes().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, "node-a");
    }

    #[tokio::test]
    async fn set_node_status_updates_fields() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_node(&sample_node("node-a")).await.unwrap();

        db.set_node_status("node-a", "connected", None).await.unwrap();
        let node = db.get_node("node-a").await.unwrap().unwrap();
        assert_eq!(node.status, "connected");
        assert!(node.last_check.is_some());
    }

    #[tokio::test]
    async fn dataset_upsert_then_mark_deleted() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_node(&sample_node("node-a")).await.unwrap();

        let d1 = DatasetUpsert {
            node_id: "node-a".into(),
            identifier: "urn:wmo:md:a".into(),
            title: "Dataset A".into(),
            wmo_data_policy: Some("core".into()),
            wmo_topic_hierarchy: "origin/a/data/core/weather".into(),
            self_link: None,
            collection_link: None,
            canonical_link: None,
            raw_json: "{}".into(),
        };
        db.upsert_dataset(&d1).await.unwrap();

        let marked = db
            .mark_datasets_deleted_except("node-a", &[])
            .await
            .unwrap();
        assert_eq!(marked, 1);

        let datasets = db.load_datasets_for_node("node-a").await.unwrap();
        assert_eq!(datasets[0].status, "deleted");
    }

    #[tokio::test]
    async fn dataset_kept_when_present_in_keep_set() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_node(&sample_node("node-a")).await.unwrap();

        let d1 = DatasetUpsert {
            node_id: "node-a".into(),
            identifier: "urn:wmo:md:a".into(),
            title: "Dataset A".into(),
            wmo_data_policy: None,
            wmo_topic_hierarchy: "origin/a/data/core/weather".into(),
            self_link: None,
            collection_link: None,
            canonical_link: None,
            raw_json: "{}".into(),
        };
        db.upsert_dataset(&d1).await.unwrap();

        let marked = db
            .mark_datasets_deleted_except("node-a", &["urn:wmo:md:a".to_string()])
            .await
            .unwrap();
        assert_eq!(marked, 0);

        let datasets = db.load_datasets_for_node("node-a").await.unwrap();
        assert_eq!(datasets[0].status, "active");
    }

    #[tokio::test]
    async fn station_upsert_and_membership() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_node(&sample_node("node-a")).await.unwrap();

        let dataset_id = db
            .upsert_dataset(&DatasetUpsert {
                node_id: "node-a".into(),
                identifier: "urn:wmo:md:a".into(),
                title: "Dataset A".into(),
                wmo_data_policy: None,
                wmo_topic_hierarchy: "origin/a/data/core/weather".into(),
                self_link: None,
                collection_link: None,
                canonical_link: None,
                raw_json: "{}".into(),
            })
            .await
            .unwrap();

        let station_id = db
            .upsert_station(&StationUpsert {
                wigos_id: "0-20000-0-12345".into(),
                name: "Test Station".into(),
                lon: 10.0,
                lat: 20.0,
                elevation: Some(100.0),
                facility_type: Some("landFixed".into()),
                raw_json: "{}".into(),
            })
            .await
            .unwrap();

        db.set_station_datasets(station_id, &[dataset_id])
            .await
            .unwrap();

        let station = db.get_station_by_wigos("0-20000-0-12345").await.unwrap().unwrap();
        assert_eq!(station.id, station_id);
    }

    #[tokio::test]
    async fn insert_observation_is_idempotent() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_node(&sample_node("node-a")).await.unwrap();

        let station_id = db
            .upsert_station(&StationUpsert {
                wigos_id: "0-20000-0-12345".into(),
                name: "Test Station".into(),
                lon: 10.0,
                lat: 20.0,
                elevation: None,
                facility_type: None,
                raw_json: "{}".into(),
            })
            .await
            .unwrap();

        let dataset_id = db
            .upsert_dataset(&DatasetUpsert {
                node_id: "node-a".into(),
                identifier: "urn:wmo:md:a".into(),
                title: "Dataset A".into(),
                wmo_data_policy: None,
                wmo_topic_hierarchy: "origin/a/data/core/weather".into(),
                self_link: None,
                collection_link: None,
                canonical_link: None,
                raw_json: "{}".into(),
            })
            .await
            .unwrap();

        let obs = ObservationInsert {
            message_id: "msg-1",
            station_id,
            dataset_id,
            data_id: Some("data-1"),
            publish_datetime: Some("2026-07-28T00:00:00Z".into()),
            observation_datetime: "2026-07-28T00:00:01Z".into(),
            canonical_link: Some("https://example.org/data/1"),
            raw_json: "{}".into(),
        };

        let first = db.insert_observation(&obs).await.unwrap();
        assert!(first);
        let second = db.insert_observation(&obs).await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn record_sync_writes_audit_row() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_node(&sample_node("node-a")).await.unwrap();

        db.record_sync(&SyncLogEntry {
            node_id: "node-a",
            sync_type: "discovery_metadata",
            status: "ok",
            items_found: 3,
            items_created: 2,
            items_updated: 1,
            items_deleted: 0,
            error_message: None,
            started_at: 1000,
            completed_at: Some(1001),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn health_check_succeeds() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.health_check().await.unwrap();
    }
}
