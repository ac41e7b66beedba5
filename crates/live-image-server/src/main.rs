use color_eyre::eyre::{self, WrapErr};
use live_image_gateway::ApiServerConfig;
use live_image_server::{create_app, DEFAULT_LOG_FILTER};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ApiServerConfig::from_env().wrap_err("invalid server configuration")?;
    let addr = config.listen_addr();
    let prefix = config.api_prefix.clone();
    let app = create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    info!("Live image API listening on {} (prefix '{}')", addr, prefix);

    axum::serve(listener, app).await?;

    Ok(())
}
