use std::sync::Arc;

use anyhow::Context;

use dialback_api::app::{build_app, services};
use dialback_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dialback_observability::init();

    let settings = Settings::from_env().context("failed to load settings")?;
    if settings.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set; every webhook will be rejected");
    }
    let bind_addr = settings.bind_addr;

    let services = Arc::new(
        services::build_services(settings)
            .await
            .context("failed to build services")?,
    );
    let background = services.spawn_background();
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
