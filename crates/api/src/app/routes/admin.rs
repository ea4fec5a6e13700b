//! Operator endpoints: manual dispatch, job queue inspection, and purge.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use dialback_infra::jobs::JobId;

use crate::app::dto::{self, LimitQuery, PurgeCallsRequest};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/process-due", post(process_due))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/dead-letters", get(list_dead_letters))
        .route("/jobs/dead-letters/:id/retry", post(retry_dead_letter))
        .route("/calls/purge", post(purge_calls))
}

/// POST /admin/process-due - run one dispatcher scan now
pub async fn process_due(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.dispatcher.process_due(Utc::now()).await {
        Ok(report) => {
            tracing::info!(enqueued = report.enqueued, "manual dispatch");
            Json(report).into_response()
        }
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /admin/jobs/stats
pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.jobs.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// GET /admin/jobs/dead-letters?limit=
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    match services.jobs.list_dead_letters(dto::list_limit(query.limit)) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// POST /admin/jobs/dead-letters/:id/retry
pub async fn retry_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_uuid(&id, "job id") {
        Ok(uuid) => JobId::from_uuid(uuid),
        Err(resp) => return resp,
    };

    match services.jobs.retry_dead_letter(id) {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// POST /admin/calls/purge - delete call records created before `before`
pub async fn purge_calls(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<PurgeCallsRequest>,
) -> axum::response::Response {
    match services.calls.purge_before(body.before).await {
        Ok(purged) => {
            tracing::info!(purged, before = %body.before, "purged call records");
            Json(json!({ "purged": purged })).into_response()
        }
        Err(e) => errors::call_error_to_response(e),
    }
}
