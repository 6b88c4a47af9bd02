mod api;
mod config;
mod kv;
mod providers;
mod redact;
mod sync;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use kv::{KvStore, MemoryKv};
use sync::SyncManager;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    if config.api_key().is_none() {
        tracing::warn!(
            "No upstream API key configured; workers will skip their runs until one is provided"
        );
    }

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    // Start the workers in the background
    let sync_manager = Arc::new(
        SyncManager::new(kv.clone(), config.clone()).expect("Failed to initialize sync manager"),
    );
    let sync_manager_clone = sync_manager.clone();
    tokio::spawn(async move {
        sync_manager_clone.start().await;
    });

    // Build the app
    let app = api::router(kv).layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listen address");

    tracing::info!(addr = %config.bind_addr, "Server running");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
