//! The HTTP/WebSocket server (C5, C8, C9).
//!
//! Router wiring follows the teacher's `server.rs` shape (`Extension` state,
//! `Router::new().route(...).layer(...)`), generalized from a single POST
//! route to the full surface in `SPEC_FULL.md` §6. Per-endpoint validation
//! (bbox ordering, lat/lon ranges, parameter whitelist, precision bounds)
//! is grounded on `examples/original_source/backend/app/main.py`'s inline
//! checks.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::aggregation;
use crate::broker::Broker;
use crate::config::Config;
use crate::error_response::AppError;
use crate::geohash_index;
use crate::models::{Anomaly, IngestRequest, Reading};
use crate::store::StoreClient;
use crate::ws_hub::{self, WsHub};

const VALID_PARAMETERS: [&str; 5] = ["pm25", "pm10", "no2", "so2", "o3"];
const MIN_PRECISION: usize = 2;
const MAX_PRECISION: usize = 9;

struct AppState {
    config: Arc<Config>,
    store: Arc<StoreClient>,
    broker: Arc<Broker>,
    hub: Arc<WsHub>,
}

/// Runs the HTTP/WebSocket server. Should not return under normal operation.
pub async fn run_server(
    config: Arc<Config>,
    store: Arc<StoreClient>,
    broker: Arc<Broker>,
    hub: Arc<WsHub>,
) -> Result<()> {
    let listen_address = config.listen_address.clone();
    let state = Arc::new(AppState {
        config,
        store,
        broker,
        hub,
    });

    let app = Router::new()
        .route("/api/v1/air_quality/ingest", post(handle_ingest))
        .route("/api/v1/air_quality/heatmap_data", get(handle_heatmap))
        .route("/api/v1/air_quality/location", get(handle_location))
        .route(
            "/api/v1/air_quality/history/coordinates/:parameter",
            get(handle_history_coordinates),
        )
        .route(
            "/api/v1/air_quality/history/:geohash/:parameter",
            get(handle_history_geohash),
        )
        .route("/api/v1/anomalies", get(handle_anomalies))
        .route("/api/v1/pollution_density", get(handle_density))
        .route("/api/v1/ws/anomalies", get(handle_ws_upgrade))
        .route(
            "/api/v1/test/broadcast-anomaly",
            post(handle_test_broadcast),
        )
        .layer(Extension(state))
        .layer(DefaultBodyLimit::max(16384));

    let listen_addr = listen_address
        .parse()
        .with_context(|| format!("could not parse listen address: {:?}", listen_address))?;

    info!("listening on {listen_addr}");
    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await
        .context("web server failed to start")
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

/// POST /api/v1/air_quality/ingest
#[instrument(name = "handle_ingest", level = "debug", skip_all)]
async fn handle_ingest(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<IngestRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    body.validate().map_err(AppError::InvalidInput)?;

    let payload = serde_json::to_vec(&body)
        .map_err(|err| AppError::Internal(err.into()))?;
    state
        .broker
        .publish_raw(&payload)
        .await
        .map_err(AppError::PublishFailed)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "reading accepted for processing".to_owned(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct BBoxQuery {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    #[serde(default)]
    zoom: Option<u32>,
    #[serde(default)]
    window: Option<String>,
}

fn validate_bbox(q: &BBoxQuery) -> Result<(), String> {
    if q.min_lat >= q.max_lat || q.min_lon >= q.max_lon {
        return Err("min_lat/min_lon must be strictly less than max_lat/max_lon".to_owned());
    }
    if !(-90.0..=90.0).contains(&q.min_lat) || !(-90.0..=90.0).contains(&q.max_lat) {
        return Err("latitude must be between -90 and 90".to_owned());
    }
    if !(-180.0..=180.0).contains(&q.min_lon) || !(-180.0..=180.0).contains(&q.max_lon) {
        return Err("longitude must be between -180 and 180".to_owned());
    }
    Ok(())
}

/// GET /api/v1/air_quality/heatmap_data
#[instrument(name = "handle_heatmap", level = "debug", skip_all)]
async fn handle_heatmap(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<BBoxQuery>,
) -> Result<Json<Vec<crate::models::AggregatedPoint>>, AppError> {
    validate_bbox(&q).map_err(AppError::InvalidInput)?;
    let window = q.window.as_deref().unwrap_or("24h");
    let zoom = q.zoom.unwrap_or(10);
    let precision = aggregation::precision_for_zoom(zoom);

    let readings = state
        .store
        .query_raw_in_bbox(q.min_lat, q.max_lat, q.min_lon, q.max_lon, window, 10_000)
        .await
        .map_err(AppError::StoreUnavailable)?;

    Ok(Json(aggregation::aggregate_by_cell(&readings, precision)))
}

#[derive(Debug, Deserialize)]
struct LocationQuery {
    lat: f64,
    lon: f64,
    #[serde(default)]
    geohash_precision: Option<usize>,
    #[serde(default)]
    window: Option<String>,
}

/// GET /api/v1/air_quality/location
#[instrument(name = "handle_location", level = "debug", skip_all)]
async fn handle_location(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<LocationQuery>,
) -> Result<Json<Option<Reading>>, AppError> {
    validate_lat_lon(q.lat, q.lon).map_err(AppError::InvalidInput)?;
    let precision = validate_precision(q.geohash_precision.unwrap_or(state.config.storage_precision))
        .map_err(AppError::InvalidInput)?;
    let window = q.window.as_deref().unwrap_or("24h").to_owned();

    let reading = state
        .store
        .query_latest_cell(q.lat, q.lon, precision, &window)
        .await
        .map_err(AppError::StoreUnavailable)?;
    Ok(Json(reading))
}

fn validate_lat_lon(lat: f64, lon: f64) -> Result<(), String> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err("lat must be between -90 and 90".to_owned());
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err("lon must be between -180 and 180".to_owned());
    }
    Ok(())
}

fn validate_precision(precision: usize) -> Result<usize, String> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(format!(
            "geohash_precision must be between {MIN_PRECISION} and {MAX_PRECISION}"
        ));
    }
    Ok(precision)
}

fn validate_parameter(parameter: &str) -> Result<(), String> {
    if !VALID_PARAMETERS.contains(&parameter) {
        return Err(format!(
            "parameter must be one of {:?}",
            VALID_PARAMETERS
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct HistoryCoordinatesQuery {
    lat: f64,
    lon: f64,
    #[serde(default)]
    geohash_precision: Option<usize>,
    #[serde(default)]
    window: Option<String>,
    #[serde(default)]
    aggregate: Option<String>,
}

/// GET /api/v1/air_quality/history/coordinates/:parameter
#[instrument(name = "handle_history_coordinates", level = "debug", skip_all)]
async fn handle_history_coordinates(
    Extension(state): Extension<Arc<AppState>>,
    axum::extract::Path(parameter): axum::extract::Path<String>,
    Query(q): Query<HistoryCoordinatesQuery>,
) -> Result<Json<Vec<crate::models::TimeSeriesPoint>>, AppError> {
    validate_parameter(&parameter).map_err(AppError::InvalidInput)?;
    validate_lat_lon(q.lat, q.lon).map_err(AppError::InvalidInput)?;
    let precision = validate_precision(q.geohash_precision.unwrap_or(state.config.storage_precision))
        .map_err(AppError::InvalidInput)?;
    let window = q.window.as_deref().unwrap_or("7d").to_owned();
    let aggregate = q.aggregate.as_deref().unwrap_or("1h").to_owned();

    let cell = geohash_index::encode(q.lat, q.lon, precision)
        .map_err(|err| AppError::InvalidInput(err.to_string()))?;

    let points = state
        .store
        .query_history(&cell, &parameter, &window, &aggregate)
        .await
        .map_err(AppError::StoreUnavailable)?;
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
struct HistoryGeohashQuery {
    #[serde(default)]
    window: Option<String>,
    #[serde(default)]
    aggregate: Option<String>,
}

/// GET /api/v1/air_quality/history/:geohash/:parameter
#[instrument(name = "handle_history_geohash", level = "debug", skip_all)]
async fn handle_history_geohash(
    Extension(state): Extension<Arc<AppState>>,
    axum::extract::Path((geohash, parameter)): axum::extract::Path<(String, String)>,
    Query(q): Query<HistoryGeohashQuery>,
) -> Result<Json<Vec<crate::models::TimeSeriesPoint>>, AppError> {
    validate_parameter(&parameter).map_err(AppError::InvalidInput)?;
    if geohash.is_empty() || !geohash.chars().all(|c| geohash_index::BASE32_CHARS.contains(c)) {
        return Err(AppError::InvalidInput("invalid geohash".to_owned()));
    }
    let window = q.window.as_deref().unwrap_or("7d").to_owned();
    let aggregate = q.aggregate.as_deref().unwrap_or("1h").to_owned();

    let points = state
        .store
        .query_history(&geohash, &parameter, &window, &aggregate)
        .await
        .map_err(AppError::StoreUnavailable)?;
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
struct AnomaliesQuery {
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
}

/// GET /api/v1/anomalies
#[instrument(name = "handle_anomalies", level = "debug", skip_all)]
async fn handle_anomalies(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<AnomaliesQuery>,
) -> Result<Json<Vec<Anomaly>>, AppError> {
    let (start, end) = resolve_anomaly_range(q.start_time, q.end_time);
    let anomalies = state
        .store
        .query_anomalies(start, end)
        .await
        .map_err(AppError::StoreUnavailable)?;
    Ok(Json(anomalies))
}

/// Per `SPEC_FULL.md` §4.9: default last 24h when both are unset; if only
/// one is set, infer the other.
fn resolve_anomaly_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    match (start, end) {
        (None, None) => (None, None),
        (Some(s), None) => (Some(s), Some(Utc::now())),
        (None, Some(e)) => (Some(e - ChronoDuration::hours(24)), Some(e)),
        (Some(s), Some(e)) => (Some(s), Some(e)),
    }
}

/// GET /api/v1/pollution_density
#[instrument(name = "handle_density", level = "debug", skip_all)]
async fn handle_density(
    Extension(state): Extension<Arc<AppState>>,
    Query(q): Query<BBoxQuery>,
) -> Result<Json<Option<crate::models::PollutionDensity>>, AppError> {
    validate_bbox(&q).map_err(AppError::InvalidInput)?;
    let window = q.window.as_deref().unwrap_or("24h");

    let density = state
        .store
        .query_density(q.min_lat, q.max_lat, q.min_lon, q.max_lon, window)
        .await
        .map_err(AppError::StoreUnavailable)?;
    Ok(Json(density))
}

/// GET /api/v1/ws/anomalies
async fn handle_ws_upgrade(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    let store = Arc::clone(&state.store);
    ws.on_upgrade(move |socket| async move {
        let since = Utc::now() - ChronoDuration::hours(24);
        let recent = store
            .query_anomalies(Some(since), Some(Utc::now()))
            .await
            .unwrap_or_else(|err| {
                warn!("could not load recent anomalies for new subscriber: {err:#}");
                Vec::new()
            });
        ws_hub::handle_socket(socket, hub, recent).await;
    })
}

#[derive(Serialize)]
struct BroadcastTestResponse {
    message: String,
    anomaly_id: String,
}

/// POST /api/v1/test/broadcast-anomaly
///
/// Publishes a synthetic anomaly through the real fanout path, for exercising
/// the WebSocket hub end-to-end without waiting on the worker/detector.
#[instrument(name = "handle_test_broadcast", level = "debug", skip_all)]
async fn handle_test_broadcast(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<BroadcastTestResponse>, AppError> {
    let synthetic = Anomaly {
        id: format!("anomaly_{}", Uuid::new_v4()),
        latitude: 0.0,
        longitude: 0.0,
        timestamp: Utc::now(),
        parameter: "pm25".to_owned(),
        value: 999.0,
        description: "synthetic test anomaly".to_owned(),
    };
    let payload = serde_json::to_vec(&synthetic).map_err(|err| AppError::Internal(err.into()))?;
    state
        .broker
        .publish_broadcast(&payload)
        .await
        .map_err(AppError::PublishFailed)?;

    Ok(Json(BroadcastTestResponse {
        message: "broadcast anomaly published".to_owned(),
        anomaly_id: synthetic.id,
    }))
}
