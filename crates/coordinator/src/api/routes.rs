use super::error::ApiResult;
use super::AppState;
use crate::group::{GroupStatus, RankState};
use crate::request::ChatRequest;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use lockstep_common::metrics::LatencyTimer;
use lockstep_common::{LockstepError, METRICS};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, instrument, warn, Instrument};

pub const EVENT_STREAM: &str = "text/event-stream";
const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4";

/// `POST /chat`
///
/// The body is taken raw so malformed JSON gets the same structured error
/// as any other rejected request.
#[instrument(skip_all)]
pub async fn chat(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let start = Instant::now();
    METRICS.chat.requests_total.inc();

    let request = ChatRequest::parse(&body).map_err(|e| {
        warn!(code = e.code, message = %e.message, "Rejected chat request");
        METRICS.chat.requests_rejected.with_label_values(&[e.code]).inc();
        e
    })?;
    debug!(messages = request.dialog.len(), stream = request.stream, "Chat request accepted");

    // A dropped connection must not cancel a cycle half way.
    let dispatcher = state.dispatcher.clone();
    let dialog = request.dialog;
    let outcome = tokio::spawn(async move { dispatcher.dispatch(dialog).await }.in_current_span())
        .await
        .map_err(|e| LockstepError::internal(format!("dispatch task failed: {}", e)))?;
    METRICS.chat.request_duration.observe_since(start);

    let result = match outcome {
        Ok(result) => {
            METRICS.chat.requests_success.inc();
            result
        }
        Err(e) => {
            METRICS.chat.requests_failed.inc();
            return Err(e.into());
        }
    };

    if request.stream {
        let body = state.formatter.stream(&result);
        Ok(([(header::CONTENT_TYPE, EVENT_STREAM)], body).into_response())
    } else {
        Ok(Json(state.formatter.complete(&result)).into_response())
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub size: usize,
    pub ranks: Vec<RankState>,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let group = state.dispatcher.group();
    let status = group.status();
    let code = match status {
        GroupStatus::Ready => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };

    let report = HealthReport {
        status: status.as_str(),
        reason: status.reason().map(str::to_string),
        size: group.size(),
        ranks: group.rank_states(),
    };
    (code, Json(report))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    ([(header::CONTENT_TYPE, PROMETHEUS_TEXT)], METRICS.gather()).into_response()
}
