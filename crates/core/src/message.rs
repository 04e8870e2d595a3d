//! Resolves a raw WIS2 notification message into an observation row.
//!
//! Resolution order: pull the message/station/metadata identifiers out of
//! the JSON payload (id, station, datetime all required — any missing one
//! drops the message), look the station up (retrying a catalogue sync
//! exactly once if it's missing, since a station can legitimately arrive
//! after its first observation), look the dataset up by its `metadata_id`
//! URN (no retry — a dataset miss drops the message, same as a station
//! miss that survives the retry), parse the observation's own datetime
//! (required — this is the time-series key) and the publish time
//! (optional, falling back to the message's own receipt time on failure
//! or absence), and scan the WIS2 `links` array for a canonical link.

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::catalogue;
use crate::db::{Db, NodeRow, ObservationInsert};
use crate::errors::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct ResolvedObservation {
    pub message_id: String,
    pub station_id: i64,
    pub dataset_id: i64,
    pub data_id: Option<String>,
    pub publish_datetime: String,
    pub observation_datetime: String,
    pub canonical_link: Option<String>,
    pub raw_json: String,
}

/// Parses a raw MQTT payload and resolves it against the database into a
/// row ready for insertion. `received_at` is the wall-clock time the
/// message arrived at this client — used only as the fallback publish
/// time when `properties.pubtime` is absent or unparseable. One
/// catalogue-sync retry is attempted if the station isn't found yet;
/// everything else about a miss is terminal.
pub async fn resolve(
    db: &Db,
    node: &NodeRow,
    payload: &[u8],
    received_at: OffsetDateTime,
) -> CoreResult<ResolvedObservation> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| CoreError::DecodeFailed(format!("invalid json payload: {e}")))?;

    let properties = value.get("properties").unwrap_or(&value);

    let message_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::DecodeFailed("message missing 'id'".into()))?
        .to_string();

    let wigos_id = properties
        .get("wigos_station_identifier")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::DecodeFailed("message missing wigos_station_identifier".into()))?;

    let data_id = properties.get("data_id").and_then(|v| v.as_str()).map(String::from);
    let metadata_id = properties
        .get("metadata_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::DecodeFailed("message missing metadata_id".into()))?;

    let station = lookup_station_with_retry(db, node, wigos_id).await?;

    let dataset_id = db
        .get_dataset_by_identifier(metadata_id)
        .await
        .map_err(|e| CoreError::PersistFailed(sqlx::Error::Protocol(e.to_string())))?
        .ok_or_else(|| CoreError::ResolveMissing(format!("unknown dataset {metadata_id}")))?
        .id;

    // pubtime is optional: a missing key or an unparseable value both fall
    // back to the receipt time rather than dropping the message.
    let publish_datetime = properties
        .get("pubtime")
        .and_then(|v| v.as_str())
        .and_then(|s| parse_rfc3339(s).ok())
        .unwrap_or(received_at)
        .format(&Rfc3339)
        .map_err(|e| CoreError::DecodeFailed(format!("failed to format pubtime: {e}")))?;

    let observation_datetime_raw = properties
        .get("datetime")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::DecodeFailed("message missing 'datetime'".into()))?;
    let observation_datetime = parse_rfc3339(observation_datetime_raw)?
        .format(&Rfc3339)
        .map_err(|e| CoreError::DecodeFailed(format!("failed to format datetime: {e}")))?;

    let canonical_link = find_canonical_link(&value);

    Ok(ResolvedObservation {
        message_id,
        station_id: station.id,
        dataset_id,
        data_id,
        publish_datetime,
        observation_datetime,
        canonical_link,
        raw_json: value.to_string(),
    })
}

async fn lookup_station_with_retry(
    db: &Db,
    node: &NodeRow,
    wigos_id: &str,
) -> CoreResult<crate::db::StationRow> {
    if let Some(station) = db
        .get_station_by_wigos(wigos_id)
        .await
        .map_err(|e| CoreError::PersistFailed(sqlx::Error::Protocol(e.to_string())))?
    {
        return Ok(station);
    }

    catalogue::sync_stations(db, node)
        .await
        .map_err(|e| CoreError::ResolveMissing(format!("station catalogue resync failed: {e}")))?;

    db.get_station_by_wigos(wigos_id)
        .await
        .map_err(|e| CoreError::PersistFailed(sqlx::Error::Protocol(e.to_string())))?
        .ok_or_else(|| CoreError::ResolveMissing(format!("unknown station {wigos_id}")))
}

fn parse_rfc3339(s: &str) -> CoreResult<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| CoreError::DecodeFailed(format!("invalid RFC-3339 datetime '{s}': {e}")))
}

fn find_canonical_link(value: &Value) -> Option<String> {
    value
        .get("links")
        .and_then(|v| v.as_array())
        .and_then(|links| {
            links
                .iter()
                .find(|l| l.get("rel").and_then(|r| r.as_str()) == Some("canonical"))
        })
        .and_then(|l| l.get("href").and_then(|h| h.as_str()))
        .map(String::from)
}

/// Persist a resolved observation. Returns `true` if newly inserted.
pub async fn store(db: &Db, obs: &ResolvedObservation) -> CoreResult<bool> {
    db.insert_observation(&ObservationInsert {
        message_id: &obs.message_id,
        station_id: obs.station_id,
        dataset_id: obs.dataset_id,
        data_id: obs.data_id.as_deref(),
        publish_datetime: Some(obs.publish_datetime.clone()),
        observation_datetime: obs.observation_datetime.clone(),
        canonical_link: obs.canonical_link.as_deref(),
        raw_json: obs.raw_json.clone(),
    })
    .await
    .map_err(|e| CoreError::PersistFailed(sqlx::Error::Protocol(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::parse("2026-07-28T00:00:00Z", &Rfc3339).unwrap()
    }

    #[test]
    fn find_canonical_link_picks_matching_rel() {
        let value = serde_json::json!({
            "links": [
                {"rel": "self", "href": "https://example.org/self"},
                {"rel": "canonical", "href": "https://example.org/canonical"}
            ]
        });
        assert_eq!(find_canonical_link(&value), Some("https://example.org/canonical".into()));
    }

    #[test]
    fn find_canonical_link_absent() {
        let value = serde_json::json!({"links": [{"rel": "self", "href": "x"}]});
        assert_eq!(find_canonical_link(&value), None);
    }

    #[test]
    fn parse_rfc3339_rejects_non_rfc3339() {
        assert!(parse_rfc3339("not-a-date").is_err());
    }

    #[test]
    fn parse_rfc3339_accepts_valid_timestamp() {
        assert!(parse_rfc3339("2026-07-28T12:00:00Z").is_ok());
    }

    #[tokio::test]
    async fn resolve_drops_message_missing_metadata_id() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = crate::db::NodeConfig {
            node_id: "node-a".into(),
            name: "Node A".into(),
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
        };
        db.upsert_node(&config).await.unwrap();
        let node = db.get_node("node-a").await.unwrap().unwrap();

        let payload = serde_json::json!({
            "id": "msg-1",
            "properties": {
                "wigos_station_identifier": "0-20000-0-12345",
                "datetime": "2026-07-28T12:00:00Z"
            }
        });

        let err = resolve(&db, &node, payload.to_string().as_bytes(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DecodeFailed(msg) if msg.contains("metadata_id")));
    }

    #[tokio::test]
    async fn resolve_drops_message_missing_datetime() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&crate::db::NodeConfig {
            node_id: "node-a".into(),
            name: "Node A".into(),
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
        })
        .await
        .unwrap();
        let node = db.get_node("node-a").await.unwrap().unwrap();

        let payload = serde_json::json!({
            "id": "msg-1",
            "properties": {
                "wigos_station_identifier": "0-20000-0-12345",
                "metadata_id": "urn:x:ds1"
            }
        });

        let err = resolve(&db, &node, payload.to_string().as_bytes(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DecodeFailed(msg) if msg.contains("datetime")));
    }

    #[tokio::test]
    async fn resolve_defaults_missing_pubtime_to_received_at() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&crate::db::NodeConfig {
            node_id: "node-a".into(),
            name: "Node A".into(),
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
        })
        .await
        .unwrap();
        db.upsert_station(&crate::db::StationUpsert {
            wigos_id: "0-20000-0-12345".into(),
            name: "Test".into(),
            lon: 0.0,
            lat: 0.0,
            elevation: None,
            facility_type: None,
            raw_json: "{}".into(),
        })
        .await
        .unwrap();
        db.upsert_dataset(&crate::db::DatasetUpsert {
            node_id: "node-a".into(),
            identifier: "urn:x:ds1".into(),
            title: "Dataset 1".into(),
            wmo_data_policy: None,
            wmo_topic_hierarchy: "origin/a/data/core/weather".into(),
            self_link: None,
            collection_link: None,
            canonical_link: None,
            raw_json: "{}".into(),
        })
        .await
        .unwrap();
        let node = db.get_node("node-a").await.unwrap().unwrap();

        let payload = serde_json::json!({
            "id": "msg-1",
            "properties": {
                "wigos_station_identifier": "0-20000-0-12345",
                "metadata_id": "urn:x:ds1",
                "datetime": "2026-07-28T12:00:00Z"
            }
        });

        let resolved = resolve(&db, &node, payload.to_string().as_bytes(), now())
            .await
            .unwrap();
        assert_eq!(resolved.publish_datetime, "2026-07-28T00:00:00Z");
    }

    #[tokio::test]
    async fn resolve_falls_back_to_received_at_on_unparseable_pubtime() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&crate::db::NodeConfig {
            node_id: "node-a".into(),
            name: "Node A".into(),
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
        })
        .await
        .unwrap();
        db.upsert_station(&crate::db::StationUpsert {
            wigos_id: "0-20000-0-12345".into(),
            name: "Test".into(),
            lon: 0.0,
            lat: 0.0,
            elevation: None,
            facility_type: None,
            raw_json: "{}".into(),
        })
        .await
        .unwrap();
        db.upsert_dataset(&crate::db::DatasetUpsert {
            node_id: "node-a".into(),
            identifier: "urn:x:ds1".into(),
            title: "Dataset 1".into(),
            wmo_data_policy: None,
            wmo_topic_hierarchy: "origin/a/data/core/weather".into(),
            self_link: None,
            collection_link: None,
            canonical_link: None,
            raw_json: "{}".into(),
        })
        .await
        .unwrap();
        let node = db.get_node("node-a").await.unwrap().unwrap();

        let payload = serde_json::json!({
            "id": "msg-1",
            "properties": {
                "wigos_station_identifier": "0-20000-0-12345",
                "metadata_id": "urn:x:ds1",
                "datetime": "2026-07-28T12:00:00Z",
                "pubtime": "not-a-timestamp"
            }
        });

        let resolved = resolve(&db, &node, payload.to_string().as_bytes(), now())
            .await
            .unwrap();
        assert_eq!(resolved.publish_datetime, "2026-07-28T00:00:00Z");
    }

    #[tokio::test]
    async fn resolve_drops_message_unknown_dataset() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        db.upsert_node(&crate::db::NodeConfig {
            node_id: "node-a".into(),
            name: "Node A".into(),
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
        })
        .await
        .unwrap();
        db.upsert_station(&crate::db::StationUpsert {
            wigos_id: "0-20000-0-12345".into(),
            name: "Test".into(),
            lon: 0.0,
            lat: 0.0,
            elevation: None,
            facility_type: None,
            raw_json: "{}".into(),
        })
        .await
        .unwrap();
        let node = db.get_node("node-a").await.unwrap().unwrap();

        let payload = serde_json::json!({
            "id": "msg-1",
            "properties": {
                "wigos_station_identifier": "0-20000-0-12345",
                "metadata_id": "urn:x:unknown",
                "datetime": "2026-07-28T12:00:00Z"
            }
        });

        let err = resolve(&db, &node, payload.to_string().as_bytes(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ResolveMissing(msg) if msg.contains("urn:x:unknown")));
    }
}
