//! Operator HTTP surface: image listing and the sync control routes.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::control::{StartOutcome, StopOutcome, SyncController};
use crate::db::{self, Pool};
use crate::model::ImageRecord;

const DEFAULT_LIST_LIMIT: u32 = 20;
const MAX_LIST_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub controller: Arc<SyncController>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": "Internal Server Error", "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

pub fn router(state: AppState, allowed_origin: &str) -> Router {
    Router::new()
        .route("/", get(list_images))
        .route("/start-sync", post(start_sync))
        .route("/stop-sync", post(stop_sync))
        .route("/sync-status", get(sync_status))
        .route("/summary", get(summary))
        .fallback(not_found)
        .layer(cors_layer(allowed_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let origin = match allowed_origin {
        "*" => AllowOrigin::any(),
        other => match HeaderValue::from_str(other) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                warn!(origin = other, "invalid allowed origin; allowing any");
                AllowOrigin::any()
            }
        },
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

#[derive(Serialize, Deserialize)]
struct PageToken {
    photo_id: String,
}

/// Opaque continuation token: base64url of `{"photo_id": ...}`.
pub fn encode_page_token(photo_id: &str) -> String {
    let raw = json!({ "photo_id": photo_id }).to_string();
    URL_SAFE_NO_PAD.encode(raw)
}

pub fn decode_page_token(token: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(token.trim().trim_end_matches('=')).ok()?;
    let parsed: PageToken = serde_json::from_slice(&bytes).ok()?;
    Some(parsed.photo_id)
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<String>,
    #[serde(rename = "nextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<ImageRecord>,
    pub next_token: Option<String>,
}

fn list_limit(raw: Option<&str>) -> u32 {
    raw.and_then(|l| l.trim().parse::<i64>().ok())
        .map(|l| l.clamp(1, i64::from(MAX_LIST_LIMIT)) as u32)
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = list_limit(params.limit.as_deref());
    let after = match params.next_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => Some(
            decode_page_token(token)
                .ok_or_else(|| ApiError::BadRequest("Invalid nextToken".into()))?,
        ),
        None => None,
    };
    let page = db::scan_images(&state.pool, after.as_deref(), limit).await?;
    Ok(Json(ListResponse {
        items: page.items,
        next_token: page.last_key.as_deref().map(encode_page_token),
    }))
}

async fn start_sync(State(state): State<AppState>) -> Result<Response, ApiError> {
    let response = match state.controller.start().await? {
        StartOutcome::Started {
            execution_arn,
            resumed_from_page,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "Sync started",
                "executionArn": execution_arn,
                "resumedFromPage": resumed_from_page,
            })),
        ),
        StartOutcome::Conflict { existing_arn } => (
            StatusCode::CONFLICT,
            Json(json!({
                "message": "A sync is already running",
                "executionArn": existing_arn,
            })),
        ),
    };
    Ok(response.into_response())
}

#[derive(Debug, Default, Deserialize)]
struct StopBody {
    #[serde(rename = "executionArn")]
    execution_arn: Option<String>,
}

async fn stop_sync(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let body: StopBody = if body.iter().all(u8::is_ascii_whitespace) {
        StopBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
    };
    let response = match state.controller.stop(body.execution_arn).await? {
        StopOutcome::Accepted { execution_arn } => (
            StatusCode::OK,
            Json(json!({ "message": "Stop requested", "executionArn": execution_arn })),
        ),
        StopOutcome::MissingHandle => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "No running sync to stop and no executionArn provided" })),
        ),
        StopOutcome::StaleHandle { execution_arn } => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "Execution not found", "executionArn": execution_arn })),
        ),
        StopOutcome::Launching => (
            StatusCode::CONFLICT,
            Json(json!({ "message": "Sync is still launching; retry shortly" })),
        ),
    };
    Ok(response.into_response())
}

async fn sync_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let report = state.controller.status().await?;
    Ok(Json(report).into_response())
}

async fn summary(State(state): State<AppState>) -> Result<Response, ApiError> {
    let summary = state.controller.summary().await?;
    Ok(Json(summary).into_response())
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" })))
}
