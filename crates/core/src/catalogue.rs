//! Catalogue synchroniser: fetches a node's discovery-metadata and stations
//! GeoJSON feeds over HTTP and reconciles them into the database.
//!
//! Datasets absent from a fresh discovery-metadata fetch are marked
//! `deleted`. Stations absent from a fresh stations fetch are left alone —
//! stations outlive their publisher's advertisement.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::{Db, DatasetUpsert, NodeRow, StationUpsert, SyncLogEntry};

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    id: Option<String>,
    properties: Value,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    coordinates: Vec<f64>,
}

fn http_client(verify_ssl: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!verify_ssl)
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build http client")
}

/// Fetch and reconcile a node's discovery-metadata (dataset) feed.
pub async fn sync_discovery_metadata(db: &Db, node: &NodeRow) -> Result<()> {
    let started_at = OffsetDateTime::now_utc().unix_timestamp();
    let client = http_client(node.verify_ssl)?;

    let result = fetch_discovery_metadata(&client, node, db).await;

    match &result {
        Ok((found, created, updated, deleted)) => {
            db.record_sync(&SyncLogEntry {
                node_id: &node.node_id,
                sync_type: "discovery_metadata",
                status: "ok",
                items_found: *found,
                items_created: *created,
                items_updated: *updated,
                items_deleted: *deleted,
                error_message: None,
                started_at,
                completed_at: Some(OffsetDateTime::now_utc().unix_timestamp()),
            })
            .await?;
            info!(
                node = %node.node_id,
                found, created, updated, deleted,
                "discovery-metadata sync complete"
            );
        }
        Err(e) => {
            db.record_sync(&SyncLogEntry {
                node_id: &node.node_id,
                sync_type: "discovery_metadata",
                status: "error",
                items_found: 0,
                items_created: 0,
                items_updated: 0,
                items_deleted: 0,
                error_message: Some(&e.to_string()),
                started_at,
                completed_at: Some(OffsetDateTime::now_utc().unix_timestamp()),
            })
            .await?;
        }
    }

    result.map(|_| ())
}

async fn fetch_discovery_metadata(
    client: &reqwest::Client,
    node: &NodeRow,
    db: &Db,
) -> Result<(i64, i64, i64, i64)> {
    let body: FeatureCollection = client
        .get(&node.discovery_metadata_url)
        .send()
        .await
        .with_context(|| format!("fetch discovery-metadata for node {}", node.node_id))?
        .error_for_status()
        .with_context(|| format!("discovery-metadata http error for node {}", node.node_id))?
        .json()
        .await
        .with_context(|| format!("parse discovery-metadata json for node {}", node.node_id))?;

    let found = body.features.len() as i64;
    let mut created = 0i64;
    let mut updated = 0i64;
    let mut keep_identifiers = Vec::with_capacity(body.features.len());

    for feature in &body.features {
        let props = &feature.properties;
        let identifier = feature
            .id
            .clone()
            .or_else(|| props.get("identifier").and_then(|v| v.as_str()).map(String::from))
            .context("discovery-metadata feature missing identifier")?;
        let title = props
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or(&identifier)
            .to_string();
        let wmo_topic_hierarchy = props
            .get("wmo:topicHierarchy")
            .and_then(|v| v.as_str())
            .with_context(|| format!("dataset '{identifier}' missing wmo:topicHierarchy"))?
            .to_string();
        let wmo_data_policy = props
            .get("wmo:dataPolicy")
            .and_then(|v| v.as_str())
            .map(String::from);
        let self_link = find_link(props, "self");
        let collection_link = find_link(props, "collection");
        let canonical_link = find_link(props, "canonical");

        let raw_json = serde_json::to_string(props).unwrap_or_default();

        let existing = db.get_dataset_by_topic(&wmo_topic_hierarchy).await?;
        if existing.is_none() {
            created += 1;
        } else {
            updated += 1;
        }

        db.upsert_dataset(&DatasetUpsert {
            node_id: node.node_id.clone(),
            identifier: identifier.clone(),
            title,
            wmo_data_policy,
            wmo_topic_hierarchy,
            self_link,
            collection_link,
            canonical_link,
            raw_json,
        })
        .await?;

        keep_identifiers.push(identifier);
    }

    let deleted = db
        .mark_datasets_deleted_except(&node.node_id, &keep_identifiers)
        .await? as i64;

    Ok((found, created, updated, deleted))
}

fn find_link(props: &Value, rel: &str) -> Option<String> {
    props
        .get("links")
        .and_then(|v| v.as_array())
        .and_then(|links| {
            links.iter().find(|l| l.get("rel").and_then(|r| r.as_str()) == Some(rel))
        })
        .and_then(|l| l.get("href").and_then(|h| h.as_str()))
        .map(String::from)
}

/// Fetch and reconcile a node's stations feed. Stations absent from the
/// fetch are never removed or marked deleted.
pub async fn sync_stations(db: &Db, node: &NodeRow) -> Result<()> {
    let started_at = OffsetDateTime::now_utc().unix_timestamp();
    let client = http_client(node.verify_ssl)?;

    let result = fetch_stations(&client, node, db).await;

    match &result {
        Ok((found, created, updated)) => {
            db.record_sync(&SyncLogEntry {
                node_id: &node.node_id,
                sync_type: "stations",
                status: "ok",
                items_found: *found,
                items_created: *created,
                items_updated: *updated,
                items_deleted: 0,
                error_message: None,
                started_at,
                completed_at: Some(OffsetDateTime::now_utc().unix_timestamp()),
            })
            .await?;
            info!(node = %node.node_id, found, created, updated, "stations sync complete");
        }
        Err(e) => {
            db.record_sync(&SyncLogEntry {
                node_id: &node.node_id,
                sync_type: "stations",
                status: "error",
                items_found: 0,
                items_created: 0,
                items_updated: 0,
                items_deleted: 0,
                error_message: Some(&e.to_string()),
                started_at,
                completed_at: Some(OffsetDateTime::now_utc().unix_timestamp()),
            })
            .await?;
        }
    }

    result.map(|_| ())
}

async fn fetch_stations(
    client: &reqwest::Client,
    node: &NodeRow,
    db: &Db,
) -> Result<(i64, i64, i64)> {
    let body: FeatureCollection = client
        .get(&node.stations_url)
        .send()
        .await
        .with_context(|| format!("fetch stations for node {}", node.node_id))?
        .error_for_status()
        .with_context(|| format!("stations http error for node {}", node.node_id))?
        .json()
        .await
        .with_context(|| format!("parse stations json for node {}", node.node_id))?;

    let found = body.features.len() as i64;
    let mut created = 0i64;
    let mut updated = 0i64;

    for feature in &body.features {
        let props = &feature.properties;
        let wigos_id = feature
            .id
            .clone()
            .or_else(|| props.get("wigos_station_identifier").and_then(|v| v.as_str()).map(String::from))
            .context("station feature missing wigos id")?;
        let name = props
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&wigos_id)
            .to_string();
        let facility_type = props
            .get("facility_type")
            .and_then(|v| v.as_str())
            .map(String::from);

        let coords = feature
            .geometry
            .as_ref()
            .map(|g| &g.coordinates)
            .with_context(|| format!("station '{wigos_id}' missing geometry"))?;
        let lon = *coords.first().with_context(|| format!("station '{wigos_id}' missing lon"))?;
        let lat = *coords.get(1).with_context(|| format!("station '{wigos_id}' missing lat"))?;
        let elevation = coords.get(2).copied();

        let raw_json = serde_json::to_string(props).unwrap_or_default();

        let existing = db.get_station_by_wigos(&wigos_id).await?;
        if existing.is_none() {
            created += 1;
        } else {
            updated += 1;
        }

        let station_id = db
            .upsert_station(&StationUpsert {
                wigos_id: wigos_id.clone(),
                name,
                lon,
                lat,
                elevation,
                facility_type,
                raw_json,
            })
            .await?;

        // Station membership is recomputed from properties.topics on each
        // sync, per the data model — distinct from a dataset's own single
        // wmo:topicHierarchy pattern.
        let topics: Vec<String> = props
            .get("topics")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let mut dataset_ids = Vec::new();
        for topic in &topics {
            if let Some(d) = db.get_dataset_by_topic(topic).await? {
                dataset_ids.push(d.id);
            }
        }
        db.set_station_datasets(station_id, &dataset_ids).await?;
    }

    Ok((found, created, updated))
}

/// Chain discovery-metadata then stations sync for a single node.
pub async fn sync_metadata(db: &Db, node: &NodeRow) -> Result<()> {
    sync_discovery_metadata(db, node).await?;
    sync_stations(db, node).await?;
    Ok(())
}

/// Independent HTTP health probe of a node's discovery-metadata endpoint,
/// distinct from the MQTT-session health in `node_client`.
pub async fn probe_node_health(node: &NodeRow) -> Result<()> {
    let client = http_client(node.verify_ssl)?;
    client
        .head(&node.discovery_metadata_url)
        .send()
        .await
        .with_context(|| format!("health probe failed for node {}", node.node_id))?
        .error_for_status()
        .with_context(|| format!("health probe returned error status for node {}", node.node_id))?;
    Ok(())
}

/// Run discovery-metadata + stations sync across every active node, logging
/// (not propagating) per-node failures so one bad node doesn't stop the rest.
pub async fn sync_all_nodes(db: &Db) -> Result<()> {
    let nodes = db.load_active_nodes().await?;
    for node in &nodes {
        if let Err(e) = sync_metadata(db, node).await {
            warn!(node = %node.node_id, error = %e, "catalogue sync failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_link_returns_matching_rel() {
        let props: Value = serde_json::json!({
            "links": [
                {"rel": "self", "href": "https://example.org/self"},
                {"rel": "collection", "href": "https://example.org/collection"}
            ]
        });
        assert_eq!(find_link(&props, "self"), Some("https://example.org/self".to_string()));
        assert_eq!(
            find_link(&props, "collection"),
            Some("https://example.org/collection".to_string())
        );
        assert_eq!(find_link(&props, "missing"), None);
    }

    #[test]
    fn find_link_no_links_field() {
        let props: Value = serde_json::json!({});
        assert_eq!(find_link(&props, "self"), None);
    }

    #[test]
    fn feature_collection_parses_minimal() {
        let json = r#"{"type":"FeatureCollection","features":[]}"#;
        let fc: FeatureCollection = serde_json::from_str(json).unwrap();
        assert!(fc.features.is_empty());
    }
}
