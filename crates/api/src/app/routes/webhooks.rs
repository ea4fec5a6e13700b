//! Provider webhook ingestion.
//!
//! The body is taken as raw text so it can be archived exactly as received,
//! including bodies that are not valid JSON.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;

use dialback_infra::reconciler::SECRET_HEADER;

use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/voice", post(voice_webhook))
}

/// POST /webhooks/voice
pub async fn voice_webhook(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: String,
) -> axum::response::Response {
    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !services.reconciler.authenticate(provided) {
        tracing::warn!("webhook rejected: missing or invalid secret");
        return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid webhook secret");
    }

    match services.reconciler.ingest(&body, Utc::now()).await {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => errors::reconcile_error_to_response(e),
    }
}
