//! HTTP surface: credentials, signaling, reports and session status.

use crate::session::SessionStore;
use crate::signaling::{OfferAnswer, OfferRequest, SignalingError, SignalingHandler};
use crate::turn::{Credential, CredentialError, CredentialMinter};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};


/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    pub minter: Arc<CredentialMinter>,
    pub signaling: Arc<SignalingHandler>,
    pub store: Arc<SessionStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/turn-creds", get(turn_credentials))
        .route("/webrtc/offer", post(webrtc_offer))
        .route("/webrtc/report", post(webrtc_report))
        .route("/webrtc/sessions/:test_id", get(session_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::SecretUnset => ApiError::Unavailable(e.to_string()),
            CredentialError::ExpiryOutOfRange(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SignalingError> for ApiError {
    fn from(e: SignalingError) -> Self {
        match e {
            SignalingError::InvalidRequest(_) | SignalingError::InvalidOffer(_) => {
                ApiError::BadRequest(e.to_string())
            }
            SignalingError::Unavailable | SignalingError::AtCapacity(_) => {
                ApiError::Unavailable(e.to_string())
            }
            SignalingError::Transport(_)
            | SignalingError::GatheringTimeout(_)
            | SignalingError::SessionClosed => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "sessions": state.store.len() }))
}

/// `ttl` stays a string so junk values fall back to the default instead of
/// failing the request.
#[derive(Debug, Deserialize)]
struct CredentialQuery {
    ttl: Option<String>,
}

impl CredentialQuery {
    /// Integers beyond `i64` saturate; the minter clamps them anyway.
    fn requested_ttl(&self) -> Option<i64> {
        let ttl: i128 = self.ttl.as_deref()?.trim().parse().ok()?;
        Some(ttl.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }
}

async fn turn_credentials(
    State(state): State<AppState>,
    Query(query): Query<CredentialQuery>,
) -> Result<Json<Credential>, ApiError> {
    let credential = state.minter.mint(query.requested_ttl(), Utc::now())?;
    info!(
        username = %credential.username,
        ttl_sec = credential.ttl_seconds,
        "🔑 relay credential issued"
    );
    Ok(Json(credential))
}

async fn webrtc_offer(
    State(state): State<AppState>,
    payload: Result<Json<OfferRequest>, JsonRejection>,
) -> Result<Json<OfferAnswer>, ApiError> {
    let Json(request) = payload?;
    let answer = state.signaling.handle_offer(request).await?;
    Ok(Json(answer))
}

/// Client-side summary. Only `testId` matters to the server; the rest is
/// logged next to the server's own counters.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    test_id: Option<String>,
    sent: Option<u64>,
    received: Option<u64>,
    loss_percent: Option<f64>,
    rtt_p50_ms: Option<f64>,
    rtt_p95_ms: Option<f64>,
    jitter_ms: Option<f64>,
}

/// Always 200. Bad bodies and unknown ids are logged only.
async fn webrtc_report(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let report: Report = match serde_json::from_slice(&body) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "unreadable report body");
            Report::default()
        }
    };

    match report.test_id.as_deref() {
        Some(test_id) => {
            let server_received = state.store.get(test_id).map(|s| s.stats().total_received);
            info!(
                session_id = %test_id,
                sent = ?report.sent,
                received = ?report.received,
                server_received = ?server_received,
                loss_percent = ?report.loss_percent,
                rtt_p50_ms = ?report.rtt_p50_ms,
                rtt_p95_ms = ?report.rtt_p95_ms,
                jitter_ms = ?report.jitter_ms,
                "📊 test report"
            );
            if !state.store.remove(test_id).await {
                warn!(session_id = %test_id, "report for unknown session");
            }
        }
        None => warn!("report without testId"),
    }

    Json(json!({ "ok": true }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    test_id: String,
    profile: Option<String>,
    state: crate::signaling::PeerState,
    age_sec: u64,
    total_received: u64,
    last_seq: Option<u64>,
    started_at: Option<DateTime<Utc>>,
    last_received_at: Option<DateTime<Utc>>,
}

async fn session_status(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let session = state
        .store
        .get(&test_id)
        .ok_or_else(|| ApiError::NotFound(format!("session {} not found", test_id)))?;

    let stats = session.stats();
    Ok(Json(SessionStatus {
        test_id,
        profile: session.profile().map(str::to_string),
        state: session.peer_state(),
        age_sec: session.age(Instant::now()).as_secs(),
        total_received: stats.total_received,
        last_seq: stats.last_seq,
        started_at: stats.started_at,
        last_received_at: stats.last_received_at,
    }))
}
