use dpr::internal::{
    api::{create_router, AppState},
    config::RegistryConfig,
};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "dpr=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RegistryConfig::load();
    let state = AppState::from_config(&config).await?;
    let app = create_router(state);

    let addr: SocketAddr = config.listen_addr.parse()?;
    tracing::info!(
        ledger = %config.ledger_url,
        builder = %config.builder_url,
        analyzer = %config.analyzer_url,
        "registry API server starting on {}",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
