//! Rampart server entry point.
//!
//! Reads configuration from the environment, builds the gateway, and serves
//! the HTTP routes until Ctrl-C.

use std::net::SocketAddr;

use rampart::{http, Gateway, GatewayConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rampart=info,tower_http=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = GatewayConfig::from_env()?;
    if config.search_url.is_none() {
        tracing::warn!("SEARCH_URL not set; queries will return the fallback payload");
    }
    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; answers will not be generated");
    }

    let gateway = Gateway::new(&config)?;
    gateway.start_sweeper(config.sweep_interval);
    let app = http::router(gateway.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "starting rampart");

    let signals = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
            gateway.shutdown().await;
        })
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(gateway.shutdown_signal())
        .await?;

    signals.await?;
    Ok(())
}
