use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use dialback_core::DomainError;
use dialback_infra::call_store::CallStoreError;
use dialback_infra::dispatcher::DispatchError;
use dialback_infra::jobs::JobStoreError;
use dialback_infra::reconciler::ReconcileError;
use dialback_infra::task_store::TaskStoreError;
use dialback_infra::worker::WorkerError;

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        e @ DomainError::InvalidTransition { .. } => json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string()),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}

pub fn task_error_to_response(err: TaskStoreError) -> axum::response::Response {
    match err {
        TaskStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("task {id} not found")),
        TaskStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("task {id} already exists"))
        }
        TaskStoreError::Domain(e) => domain_error_to_response(e),
        TaskStoreError::Storage(msg) => store_error(msg),
    }
}

pub fn call_error_to_response(err: CallStoreError) -> axum::response::Response {
    match err {
        CallStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("call record {id} not found"))
        }
        CallStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("call record {id} already exists"))
        }
        CallStoreError::Domain(e) => domain_error_to_response(e),
        CallStoreError::Storage(msg) => store_error(msg),
    }
}

pub fn job_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobStoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("job {id} already exists"))
        }
        JobStoreError::Storage(msg) => store_error(msg),
    }
}

pub fn worker_error_to_response(err: WorkerError) -> axum::response::Response {
    match err {
        WorkerError::Tasks(e) => task_error_to_response(e),
        WorkerError::Calls(e) => call_error_to_response(e),
        WorkerError::Jobs(e) => job_error_to_response(e),
    }
}

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Tasks(e) => task_error_to_response(e),
        DispatchError::Jobs(e) => job_error_to_response(e),
    }
}

/// Only an uncorrelatable event whose diagnostic record cannot be stored
/// reaches here; a 500 makes the provider redeliver it.
pub fn reconcile_error_to_response(err: ReconcileError) -> axum::response::Response {
    tracing::error!(error = %err, "webhook processing failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "webhook_error", err.to_string())
}

fn store_error(msg: String) -> axum::response::Response {
    tracing::error!(error = %msg, "store failure");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
}
