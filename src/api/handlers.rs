use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::alerts::{AlertInstance, AlertState, AlertsSnapshot};
use crate::config::{ConfigError, ConfigLoader};
use crate::data::{Labels, MetricSample};
use crate::ingest::parse_exposition;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::notify::{DeliveryLog, DeliveryRecord};
use crate::rules::AlertRule;
use crate::storage::{SeriesStore, StoreStats};

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<SeriesStore>,
    pub loader: Arc<ConfigLoader>,
    pub alerts: watch::Receiver<Arc<AlertsSnapshot>>,
    pub deliveries: Arc<DeliveryLog>,
    pub metrics: Arc<Metrics>,
    /// Unix millis
    pub started_at: i64,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Ingest
// ============================================================================

/// JSON sample; a missing timestamp means "now"
#[derive(Deserialize)]
pub struct JsonSample {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Batch { samples: Vec<JsonSample> },
    List(Vec<JsonSample>),
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub inserted: usize,
    pub errors: usize,
}

/// Accepts the text exposition format, or JSON when the content type says so
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    let now = chrono::Utc::now().timestamp_millis();
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let samples: Vec<MetricSample> = if is_json {
        let request: IngestRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON batch: {}", e)))?;
        let samples = match request {
            IngestRequest::Batch { samples } | IngestRequest::List(samples) => samples,
        };
        samples
            .into_iter()
            .map(|s| MetricSample::new(s.name, s.labels, s.value, s.timestamp.unwrap_or(now)))
            .collect()
    } else {
        let text = std::str::from_utf8(&body)
            .map_err(|_| ApiError::BadRequest("Body is not valid UTF-8".to_string()))?;
        parse_exposition(text, now).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let total = samples.len();
    let inserted = state.store.insert_batch(samples);
    state.metrics.record_ingested(inserted as u64);

    Ok(Json(IngestResponse {
        inserted,
        errors: total - inserted,
    }))
}

// ============================================================================
// Alerts & Rules
// ============================================================================

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub state: Option<AlertState>,
}

#[derive(Serialize)]
pub struct AlertsResponse {
    pub evaluated_at: Option<i64>,
    pub alerts: Vec<AlertInstance>,
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Json<AlertsResponse> {
    let snapshot = Arc::clone(&state.alerts.borrow());
    let alerts = snapshot
        .alerts
        .iter()
        .filter(|a| query.state.map_or(true, |s| a.state == s))
        .cloned()
        .collect();

    Json(AlertsResponse {
        evaluated_at: snapshot.evaluated_at,
        alerts,
    })
}

#[derive(Serialize)]
pub struct RuleInfo {
    #[serde(flatten)]
    pub rule: AlertRule,
    /// Error from the last evaluation, if the rule was skipped
    pub last_error: Option<String>,
}

#[derive(Serialize)]
pub struct RulesResponse {
    pub loaded_at: i64,
    pub rules: Vec<RuleInfo>,
    pub receivers: Vec<String>,
}

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<RulesResponse> {
    let config = state.loader.current();
    let snapshot = Arc::clone(&state.alerts.borrow());

    let rules = config
        .rules
        .iter()
        .map(|rule| RuleInfo {
            rule: rule.clone(),
            last_error: snapshot.rule_errors.get(&rule.name).cloned(),
        })
        .collect();

    Json(RulesResponse {
        loaded_at: config.loaded_at,
        rules,
        receivers: config.receiver_names(),
    })
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub status: &'static str,
    pub rules: usize,
    pub receivers: usize,
}

pub async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    let config = state.loader.reload_async().await.map_err(|e| match e {
        ConfigError::ReloadTask(_) => ApiError::Internal(e.to_string()),
        _ => ApiError::BadRequest(e.to_string()),
    })?;

    Ok(Json(ReloadResponse {
        status: "reloaded",
        rules: config.rules.len(),
        receivers: config.receivers.len(),
    }))
}

// ============================================================================
// Deliveries & Metrics
// ============================================================================

#[derive(Deserialize)]
pub struct DeliveriesQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Serialize)]
pub struct DeliveriesResponse {
    pub deliveries: Vec<DeliveryRecord>,
}

pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeliveriesQuery>,
) -> Json<DeliveriesResponse> {
    Json(DeliveriesResponse {
        deliveries: state.deliveries.recent(query.limit),
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = Arc::clone(&state.alerts.borrow());
    let store = state.store.stats();

    let body = state.metrics.render(&[
        ("klaxon_alerts_firing", snapshot.count(AlertState::Firing) as f64),
        ("klaxon_alerts_pending", snapshot.count(AlertState::Pending) as f64),
        ("klaxon_series", store.series as f64),
        ("klaxon_samples", store.samples as f64),
    ]);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub uptime_secs: i64,
    pub store: StoreStats,
    pub alerts_firing: usize,
    pub alerts_pending: usize,
    pub rules: usize,
    pub counters: MetricsSnapshot,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let snapshot = Arc::clone(&state.alerts.borrow());
    let now = chrono::Utc::now().timestamp_millis();

    Json(StatsResponse {
        uptime_secs: (now - state.started_at) / 1000,
        store: state.store.stats(),
        alerts_firing: snapshot.count(AlertState::Firing),
        alerts_pending: snapshot.count(AlertState::Pending),
        rules: state.loader.current().rules.len(),
        counters: state.metrics.snapshot(),
    })
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
