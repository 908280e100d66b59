//! HTTP request handlers for REST API.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use super::AppState;
use crate::error::GatewayError;
use crate::storage::sqlite::format_timestamp;
use crate::storage::store::DEFAULT_HISTORY_LIMIT;
use crate::storage::{HistoryQuery, MeasurementStore, StoredMeasurement};

/// Default number of buffered measurements returned
pub const DEFAULT_BUFFER_LIMIT: usize = 100;

/// Maximum rows in one CSV export
pub const EXPORT_LIMIT: usize = 100_000;

/// Columns of the CSV export
pub const CSV_HEADER: [&str; 9] = [
    "time_s", "phase", "pwm_left", "pwm_right", "speed_1", "speed_2", "angle_x", "gyro_y",
    "timestamp",
];

/// API error response
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match err {
            GatewayError::NotConnected
            | GatewayError::LinkFault(_)
            | GatewayError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Run a blocking store call off the async workers
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&dyn MeasurementStore) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            error!("Store request failed: {}", e);
            ApiError::from(e)
        })
}

/// Parse a query timestamp
///
/// Accepts RFC 3339, or a naive date/time which is taken as UTC.
pub fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(text) => parse_time(text).map(Some).ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("Invalid {} timestamp: {}", name, text),
            )
        }),
    }
}

/// Query string for `/api/data/buffer`
#[derive(Debug, Deserialize)]
pub struct BufferParams {
    pub limit: Option<usize>,
}

/// Query string for history and export
#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
}

impl RangeParams {
    fn to_query(&self, default_limit: usize) -> Result<HistoryQuery, ApiError> {
        Ok(HistoryQuery {
            start: parse_bound("start", self.start.as_deref())?,
            end: parse_bound("end", self.end.as_deref())?,
            limit: self.limit.unwrap_or(default_limit),
        })
    }
}

/// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let link = state.link.status();

    Json(json!({
        "status": "online",
        "serial_connected": link.is_connected(),
        "serial_port": link.port,
        "link": link,
        "buffer_size": state.buffer.size(),
        "buffer_capacity": state.buffer.capacity(),
        "timestamp": Utc::now(),
    }))
}

/// GET /api/data/latest
pub async fn latest(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    match state.buffer.latest() {
        Some(measurement) => Ok(Json(json!({ "success": true, "data": measurement }))),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "No data available")),
    }
}

/// GET /api/data/buffer
pub async fn buffer(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BufferParams>,
) -> Json<Value> {
    let (data, count) = state
        .buffer
        .window(params.limit.unwrap_or(DEFAULT_BUFFER_LIMIT));

    Json(json!({
        "success": true,
        "count": count,
        "data": data,
    }))
}

/// GET /api/data/history
pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Value>, ApiError> {
    let query = params.to_query(DEFAULT_HISTORY_LIMIT)?;
    let rows = with_store(&state, move |store| store.query(&query)).await?;

    Ok(Json(json!({
        "success": true,
        "count": rows.len(),
        "data": rows,
    })))
}

/// Render rows as CSV with a header line
pub fn to_csv(rows: &[StoredMeasurement]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());

    writer.write_record(CSV_HEADER)?;
    for row in rows {
        let s = &row.sample;
        writer.write_record([
            s.time_s.to_string(),
            s.phase.to_string(),
            s.pwm_left.to_string(),
            s.pwm_right.to_string(),
            s.speed_1.to_string(),
            s.speed_2.to_string(),
            s.angle_x.to_string(),
            s.gyro_y.to_string(),
            format_timestamp(row.timestamp),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// GET /api/data/export
pub async fn export(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> Result<Response, ApiError> {
    let mut query = params.to_query(EXPORT_LIMIT)?;
    query.limit = query.limit.min(EXPORT_LIMIT);

    let rows = with_store(&state, move |store| store.query(&query)).await?;
    let body = to_csv(&rows)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=mbot_data_export.csv",
            ),
        ],
        body,
    )
        .into_response())
}

/// GET /api/statistics
pub async fn statistics(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let window = state.config.storage.stats_window();
    let stats = with_store(&state, move |store| store.statistics(window)).await?;

    Ok(Json(json!({ "success": true, "statistics": stats })))
}

/// POST /api/control/start
pub async fn start(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.link.send_start().await.map_err(|e| {
        warn!("Error sending start command: {}", e);
        ApiError::from(e)
    })?;

    // The command already reached the device; a lost audit row is not a failure
    if let Err(e) = with_store(&state, |store| store.log_event("INFO", "Experiment started")).await {
        warn!("Failed to record start event: {}", e.message);
    }

    Ok(Json(json!({
        "success": true,
        "message": "START command sent to device",
    })))
}

/// GET /api/config
pub async fn config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;

    Json(json!({
        "success": true,
        "config": {
            "serial_port": config.serial.port,
            "baudrate": config.serial.baud_rate,
            "sampling_rate": config.acquisition.sampling_rate_hz,
            "buffer_capacity": config.acquisition.buffer_capacity,
            "data_retention_days": config.storage.retention_days,
        }
    }))
}
