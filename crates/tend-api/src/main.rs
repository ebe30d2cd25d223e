mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use tend_core::Replica;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tend_api=info".parse()?)
                .add_directive("tend_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting tend-api with config: {:?}", config);

    let replica = match &config.db_path {
        Some(path) => Replica::open_path(path)?,
        None => Replica::in_memory(),
    }
    .with_subscriber_capacity(config.stream_buffer);

    let state = AppState::new(config, replica.clone());
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("tend-api listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(replica))
        .await?;
    Ok(())
}

/// Resolves on ctrl-c. Closing the replica ends every open pull stream so
/// the graceful shutdown is not held up by long-lived connections.
async fn shutdown_signal(replica: Replica) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    replica.shutdown();
}
