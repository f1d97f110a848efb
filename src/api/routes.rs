//! API route definitions and handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::state::AppState;
use crate::detect::alert::AlertFilter;
use crate::detect::{DetectError, Severity};
use crate::ingest::IngestError;
use crate::storage::{self, LabeledReading, Reading, ReadingFilter};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/sensors/data", post(create_reading).get(list_readings))
        .route("/sensors/data/{sensor_id}/latest", get(latest_reading))
        .route("/sensors/{sensor_id}/score", get(score_now))
        .route("/sensors/alerts", get(list_alerts))
        .route("/sensors/alerts/{alert_id}/resolve", post(resolve_alert))
        .route("/train", post(train))
        .route("/monitoring/stats", get(stats))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    ModelUnavailable,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::ModelUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no trained model is loaded".to_string(),
            ),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        let body = Json(json!({ "error": message, "status": status.as_u16() }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = state.pool.clone();
    let db_ok = tokio::task::spawn_blocking(move || pool.get().is_ok())
        .await
        .unwrap_or(false);
    let model_loaded = state.engine.models().is_loaded();

    let status = if db_ok && model_loaded {
        "ok"
    } else if db_ok {
        "degraded"
    } else {
        "unhealthy"
    };

    let database = if db_ok { "healthy" } else { "unhealthy" };
    let model = if model_loaded { "loaded" } else { "missing" };
    envelope(json!({
        "status": status,
        "services": {
            "database": database,
            "model": model
        }
    }))
}

#[derive(Deserialize)]
struct CreateReading {
    sensor_id: String,
    sensor_type: String,
    value: f64,
    unit: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

async fn create_reading(
    State(state): State<AppState>,
    Json(body): Json<CreateReading>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let reading = Reading {
        sensor_id: body.sensor_id,
        sensor_type: body.sensor_type,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        value: body.value,
        unit: body.unit,
        location: body.location,
    };

    let receipt = state.ingest.ingest(reading).await?;
    let body = serde_json::to_value(&receipt).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, envelope(body)))
}

#[derive(Deserialize, Default)]
struct ReadingQuery {
    sensor_id: Option<String>,
    sensor_type: Option<String>,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_readings(
    State(state): State<AppState>,
    Query(query): Query<ReadingQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = ReadingFilter {
        sensor_id: query.sensor_id,
        sensor_type: query.sensor_type,
        limit: query.limit,
        offset: query.offset,
    };
    let pool = state.pool.clone();
    let readings = tokio::task::spawn_blocking(move || storage::list_readings(&pool, &filter))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    let total = readings.len();
    Ok(envelope(json!({ "readings": readings, "total": total })))
}

async fn latest_reading(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let sensor = sensor_id.clone();
    let latest = tokio::task::spawn_blocking(move || storage::latest_reading(&pool, &sensor))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    match latest {
        Some(reading) => Ok(envelope(serde_json::to_value(&reading).map_err(|e| {
            ApiError::Internal(e.to_string())
        })?)),
        None => Err(ApiError::NotFound(format!(
            "no readings for sensor {sensor_id}"
        ))),
    }
}

async fn score_now(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.engine.score_now(&sensor_id).await {
        Ok(verdict) => Ok(envelope(serde_json::to_value(&verdict).map_err(|e| {
            ApiError::Internal(e.to_string())
        })?)),
        Err(DetectError::ModelUnavailable) => Err(ApiError::ModelUnavailable),
    }
}

#[derive(Deserialize, Default)]
struct AlertQuery {
    sensor_id: Option<String>,
    severity: Option<String>,
    resolved: Option<bool>,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Value>, ApiError> {
    let severity = match query.severity {
        Some(raw) => Some(
            raw.parse::<Severity>()
                .map_err(ApiError::BadRequest)?,
        ),
        None => None,
    };
    let filter = AlertFilter {
        sensor_id: query.sensor_id,
        severity,
        resolved: query.resolved,
        limit: query.limit,
        offset: query.offset,
    };

    let engine = state.engine.clone();
    let alerts = tokio::task::spawn_blocking(move || engine.alerts().list(&filter))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    let total = alerts.len();
    Ok(envelope(json!({ "alerts": alerts, "total": total })))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let engine = state.engine.clone();
    let resolved = tokio::task::spawn_blocking(move || engine.alerts().resolve(alert_id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    if resolved {
        Ok(envelope(json!({ "message": "alert resolved" })))
    } else {
        Err(ApiError::NotFound(format!(
            "alert {alert_id} not found or already resolved"
        )))
    }
}

#[derive(Deserialize, Default)]
struct TrainRequest {
    /// Optional inline corpus; when empty, training reads the labeled rows
    /// from the store.
    #[serde(default)]
    rows: Vec<LabeledReading>,
}

async fn train(
    State(state): State<AppState>,
    Json(body): Json<TrainRequest>,
) -> Result<Json<Value>, ApiError> {
    let corpus = if body.rows.is_empty() {
        None
    } else {
        Some(body.rows)
    };

    let report = state
        .engine
        .train(corpus)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(envelope(serde_json::to_value(&report).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let stats = tokio::task::spawn_blocking(move || storage::platform_stats(&pool))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(envelope(serde_json::to_value(&stats).map_err(|e| {
        ApiError::Internal(e.to_string())
    })?))
}
