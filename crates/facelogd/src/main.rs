use anyhow::{Context as _, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod context;
mod http;
mod pipeline;
mod stream;
#[cfg(test)]
mod test_support;

use config::Config;
use context::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facelogd starting");

    let config = Config::from_env();
    let bind = config.bind;
    tracing::info!(
        cascade = %config.cascade_path.display(),
        model = %config.model_path.display(),
        db = %config.db_path.display(),
        cameras = ?config.camera_indices,
        "configuration loaded"
    );

    let ctx = AppContext::load(config)?;
    tracing::info!(
        detector_stages = ctx.detector_stages,
        recognizer_trained = ctx.recognizer.is_trained(),
        "models loaded"
    );

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "facelogd ready");

    let app = http::router(ctx.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ctx))
        .await
        .context("http server failed")?;

    tracing::info!("facelogd shutting down");
    Ok(())
}

/// Resolves on Ctrl-C and tells streaming sessions to wind down.
async fn shutdown_signal(ctx: AppContext) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    ctx.begin_shutdown();
}
