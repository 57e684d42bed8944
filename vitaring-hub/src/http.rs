/*!
OPERATOR API - HTTP surface over the telemetry hub

Routes:
- GET  /health                      liveness, no key required
- GET  /system/health               counters and current phase
- GET  /state                       current `DeviceState`
- POST /live/{id}                   start live on a device id
- POST /retarget/{id}               move to another device id
- POST /restart                     close, wait the grace delay, reopen
- POST /stop                        stop whichever source is active
- POST /synthetic?interval_ms=      start the synthetic timer
- DELETE /synthetic                 stop the synthetic timer
- POST /scenario/{name}             publish one scenario record
- POST /offline?enabled=            manual offline override

Every route except /health needs the `x-api-key` header to match
`VITARING_API_KEY`.
*/

use crate::error::TelemetryError;
use crate::health::HubHealth;
use crate::hub::TelemetryHub;
use crate::models::DeviceState;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

pub const API_KEY_ENV: &str = "VITARING_API_KEY";

#[derive(Clone)]
pub struct AppState {
    pub hub: TelemetryHub,
    pub default_interval: Duration,
}

pub struct ApiError(TelemetryError);

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        Self(e)
    }
}

pub fn status_for(err: &TelemetryError) -> StatusCode {
    match err {
        TelemetryError::InvalidOperatorCall(_) | TelemetryError::MalformedPayload { .. } => StatusCode::BAD_REQUEST,
        TelemetryError::SourceConflict { .. } => StatusCode::CONFLICT,
        TelemetryError::FeedLost | TelemetryError::SubscriptionSetup(_) => StatusCode::SERVICE_UNAVAILABLE,
        TelemetryError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = status_for(&self.0);
        (code, Json(json!({ "ok": false, "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<DeviceState>, ApiError>;

fn key_accepted(expected: &str, presented: Option<&str>) -> bool {
    !expected.is_empty() && presented == Some(expected)
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("{API_KEY_ENV} not set, operator API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }
    let presented = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !key_accepted(&expected, presented) {
        warn!("rejected operator call to {} without a valid key", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Debug, Deserialize)]
struct SyntheticParams {
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OfflineParams {
    enabled: bool,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/state", get(get_state))
        .route("/live/{id}", post(start_live))
        .route("/retarget/{id}", post(retarget))
        .route("/restart", post(restart))
        .route("/stop", post(stop))
        .route("/synthetic", post(start_synthetic).delete(stop_synthetic))
        .route("/scenario/{name}", post(emit_scenario))
        .route("/offline", post(set_offline))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

async fn get_system_health(State(app): State<AppState>) -> Json<HubHealth> {
    Json(app.hub.health())
}

async fn get_state(State(app): State<AppState>) -> Json<DeviceState> {
    Json(app.hub.snapshot())
}

// POST /live/{id}
async fn start_live(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult {
    app.hub.start_live(&id)?;
    Ok(Json(app.hub.snapshot()))
}

// POST /retarget/{id}
async fn retarget(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult {
    app.hub.retarget(&id)?;
    Ok(Json(app.hub.snapshot()))
}

// POST /restart (returns once the channel has been reopened)
async fn restart(State(app): State<AppState>) -> ApiResult {
    app.hub.restart().await?;
    Ok(Json(app.hub.snapshot()))
}

async fn stop(State(app): State<AppState>) -> Json<DeviceState> {
    app.hub.stop();
    Json(app.hub.snapshot())
}

// POST /synthetic?interval_ms=5000
async fn start_synthetic(State(app): State<AppState>, Query(params): Query<SyntheticParams>) -> ApiResult {
    let interval = params
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(app.default_interval);
    app.hub.start_synthetic(interval)?;
    Ok(Json(app.hub.snapshot()))
}

async fn stop_synthetic(State(app): State<AppState>) -> Json<DeviceState> {
    app.hub.stop_synthetic();
    Json(app.hub.snapshot())
}

// POST /scenario/{name}
async fn emit_scenario(State(app): State<AppState>, Path(name): Path<String>) -> ApiResult {
    app.hub.emit_scenario(&name)?;
    Ok(Json(app.hub.snapshot()))
}

// POST /offline?enabled=true
async fn set_offline(State(app): State<AppState>, Query(params): Query<OfflineParams>) -> Json<DeviceState> {
    app.hub.set_offline_override(params.enabled);
    Json(app.hub.snapshot())
}
