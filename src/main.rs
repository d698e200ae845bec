mod config;
mod protocol;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::ServerConfig;
use crate::services::agent::{HttpMainAgent, MainAgent, StandaloneAgent};
use crate::services::events;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env();

    // The guard flushes the event file on drop; it lives until main returns.
    let (event_layer, _event_guard, event_error) = match config.event_log_path.as_deref().map(events::file_layer) {
        Some(Ok((layer, guard))) => (Some(layer), Some(guard), None),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(event_layer)
        .with(fmt::layer().with_filter(console_filter))
        .init();
    if let Some(e) = event_error {
        tracing::warn!(error = %e, "event log unavailable, continuing without it");
    }

    std::fs::create_dir_all(&config.tables_dir).expect("failed to create tables dir");

    let agent: Arc<dyn MainAgent> = match &config.main_server_url {
        Some(url) => Arc::new(HttpMainAgent::new(url.clone()).expect("failed to build main server client")),
        None => {
            tracing::info!("MAIN_SERVER_URL not set, running standalone");
            Arc::new(StandaloneAgent::new(config.tables_dir.clone()))
        }
    };

    let port = config.port;
    let state = state::AppState::new(config, agent);

    // Spawn background housekeeping task.
    let _housekeeping = services::housekeeping::spawn_housekeeping_task(state.clone());

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    events::log("serverStart", json!({ "port": port }));
    tracing::info!(%port, "table server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    services::registry::unload_all(&state).await;
    events::log("serviceStop", json!({}));
    tracing::info!("table server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
