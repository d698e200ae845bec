//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The table server exposes a websocket endpoint at `/` for clients, a form
//! endpoint for the main server to create tables, and a health check. When
//! `SERVE_STATIC` is set, everything else falls through to static files.

pub mod tables;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let serve_static = state.config.serve_static.clone();

    let router = Router::new()
        .route("/", get(ws::handle_ws))
        .route("/tables/", post(tables::create_table))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match serve_static {
        Some(dir) => router.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true)),
        None => router,
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
