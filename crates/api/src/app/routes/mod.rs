use axum::Router;

pub mod admin;
pub mod calls;
pub mod system;
pub mod tasks;
pub mod webhooks;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/tasks", tasks::router())
        .nest("/calls", calls::router())
        .nest("/webhooks", webhooks::router())
        .nest("/admin", admin::router())
}
