use anyhow::Context;

use engage_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    engage_observability::init();

    let config = ApiConfig::from_env()?;
    let (app, services) = engage_api::app::build_app(&config)
        .await
        .context("failed to build application services")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Worker threads block on join; keep that off the async runtime.
    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    Ok(())
}
