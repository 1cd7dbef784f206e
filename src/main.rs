//! Packrat server binary

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use packrat::config::{AppConfig, LogFormat};
use packrat::registry::Registry;
use packrat::storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "packrat={},tower_http=info",
            config.log.level
        ))
    });
    match config.log.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!(storage = %config.storage, "using storage path");

    let backend = storage::create_storage(config.storage_config()?)?;
    let registry = Arc::new(Registry::new(&config, backend)?);

    let app =
        packrat::api::create_router(registry).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.listen.host, config.listen.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
