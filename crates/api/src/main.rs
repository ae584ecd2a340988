use anyhow::Context;

use sweep_infra::config::AppConfig;
use sweep_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    sweep_observability::init(LogConfig::new(config.log_format));

    let bind_addr = config.bind_addr.clone();
    let app = sweep_api::app::build_app_from_config(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
