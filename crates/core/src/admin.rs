//! Admin HTTP API: start/stop/restart individual node clients, inspect
//! fleet-wide health, and read the status-bus snapshot. This is the single
//! surface both the `serve` daemon and the other CLI subcommands talk
//! through — subcommands are thin reqwest clients against this router.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::http::StatusCode;
use axum::Router;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::fleet::FleetSupervisor;

#[derive(Clone)]
pub struct AdminState {
    pub fleet: Arc<FleetSupervisor>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/api/nodes/{node_id}/status", get(node_status))
        .route("/api/nodes/{node_id}/start", post(start_node))
        .route("/api/nodes/{node_id}/stop", post(stop_node))
        .route("/api/nodes/{node_id}/restart", post(restart_node))
        .route("/api/fleet/start-all", post(start_all))
        .route("/api/fleet/stop-all", post(stop_all))
        .route("/api/fleet/health", get(fleet_health))
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> impl IntoResponse {
    (status, Json(ErrorBody { error: err.to_string() }))
}

async fn node_status(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.fleet.health_report(&node_id).await {
        Ok(report) => Json(serde_json::json!(report)).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, e).into_response(),
    }
}

async fn start_node(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.fleet.start(&node_id).await {
        Ok(started) => Json(serde_json::json!({ "started": started })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e).into_response(),
    }
}

async fn stop_node(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.fleet.stop(&node_id).await {
        Ok(stopped) => Json(serde_json::json!({ "stopped": stopped })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e).into_response(),
    }
}

async fn restart_node(
    State(state): State<AdminState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.fleet.restart(&node_id).await {
        Ok(restarted) => Json(serde_json::json!({ "restarted": restarted })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e).into_response(),
    }
}

async fn start_all(State(state): State<AdminState>) -> impl IntoResponse {
    match state.fleet.start_all().await {
        Ok(n) => Json(serde_json::json!({ "started": n })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

async fn stop_all(State(state): State<AdminState>) -> impl IntoResponse {
    match state.fleet.stop_all().await {
        Ok(n) => Json(serde_json::json!({ "stopped": n })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

async fn fleet_health(State(state): State<AdminState>) -> impl IntoResponse {
    match state.fleet.all_health_reports().await {
        Ok(reports) => Json(serde_json::json!(reports)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

pub async fn serve(bind_addr: IpAddr, port: u16, state: AdminState) -> anyhow::Result<()> {
    let addr = SocketAddr::from((bind_addr, port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockBreakPolicy, OwnershipLocker};
    use crate::status_bus::StatusBus;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> Option<AdminState> {
        let db = crate::db::Db::connect("sqlite::memory:").await.ok()?;
        db.migrate().await.ok()?;

        // These tests only exercise routes that don't require live redis;
        // skip entirely if no local redis is reachable.
        let locker = OwnershipLocker::connect(
            "redis://127.0.0.1:6379",
            Duration::from_secs(600),
            LockBreakPolicy::OnTtlExpiredOnly,
        )
        .await
        .ok()?;
        let status_bus = StatusBus::connect(
            "redis://127.0.0.1:6379",
            Duration::from_millis(500),
            Duration::from_secs(10),
        )
        .await
        .ok()?;

        let fleet = Arc::new(FleetSupervisor::new(
            db.clone(),
            Arc::new(status_bus),
            Arc::new(locker),
            50,
            Duration::from_secs(5),
            Duration::from_secs(600),
            Duration::from_secs(120),
            Duration::from_millis(10_000),
        ));

        Some(AdminState { fleet })
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let Some(state) = test_state().await else {
            eprintln!("skipping: no local redis reachable");
            return;
        };
        let app = router(state);
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
