use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use dialback_core::CallRecordId;

use crate::app::dto::{self, CallRecordView};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/:id", get(get_call))
}

/// GET /calls/:id - call record with its ordered transcript
pub async fn get_call(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match dto::parse_uuid(&id, "call record id") {
        Ok(uuid) => CallRecordId::from_uuid(uuid),
        Err(resp) => return resp,
    };

    let record = match services.calls.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("call record {id} not found"));
        }
        Err(e) => return errors::call_error_to_response(e),
    };

    match services.calls.transcript(id).await {
        Ok(transcript) => Json(CallRecordView { record, transcript }).into_response(),
        Err(e) => errors::call_error_to_response(e),
    }
}
