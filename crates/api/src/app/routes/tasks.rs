//! Follow-up scheduling endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;

use crate::app::dto::{self, CreateTaskRequest, CreatedTask, EnrichContextRequest, ListTasksQuery};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_task).get(list_tasks))
        .route("/:id", get(get_task))
        .route("/:id/trigger", post(trigger_task))
        .route("/:id/cancel", post(cancel_task))
        .route("/:id/context", patch(enrich_context))
}

/// POST /tasks
pub async fn create_task(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateTaskRequest>,
) -> axum::response::Response {
    let task = match body.into_task(Utc::now()) {
        Ok(task) => task,
        Err(resp) => return resp,
    };

    match services.tasks.insert(&task).await {
        Ok(()) => {
            tracing::info!(task_id = %task.id, target = %task.target, due_at = %task.due_at, "follow-up scheduled");
            (StatusCode::CREATED, Json(CreatedTask::from(&task))).into_response()
        }
        Err(e) => errors::task_error_to_response(e),
    }
}

/// GET /tasks?status=&limit=
pub async fn list_tasks(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListTasksQuery>,
) -> axum::response::Response {
    let status = match dto::parse_status(query.status.as_deref()) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    match services.tasks.list(status, dto::list_limit(query.limit)).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}

/// GET /tasks/:id
pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.tasks.get(id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("task {id} not found")),
        Err(e) => errors::task_error_to_response(e),
    }
}

/// POST /tasks/:id/trigger - run the task now, synchronously
pub async fn trigger_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.worker.trigger_now(id, Utc::now()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => errors::worker_error_to_response(e),
    }
}

/// POST /tasks/:id/cancel
pub async fn cancel_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.tasks.cancel(id, Utc::now()).await {
        Ok(task) => {
            tracing::info!(task_id = %id, "follow-up cancelled");
            Json(task).into_response()
        }
        Err(e) => errors::task_error_to_response(e),
    }
}

/// PATCH /tasks/:id/context
pub async fn enrich_context(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<EnrichContextRequest>,
) -> axum::response::Response {
    let id = match dto::parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.tasks.enrich_context(id, body.context, Utc::now()).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => errors::task_error_to_response(e),
    }
}
