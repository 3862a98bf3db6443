pub mod appresult;
pub mod config;
pub mod db;
pub mod logging;
pub mod realtime;
pub mod rooms;
pub mod session;

use axum::{extract::FromRef, routing::get, Router};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

pub use appresult::{AppError, AppResult};
pub use config::Config;

use realtime::Broadcaster;
use session::Sessions;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub sessions: Sessions,
    pub hub: Broadcaster,
}

/// The whole HTTP surface: chat under `/api/v1/chat`, plus `/health`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/chat", rooms::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
