use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use postchat::{
    db, logging,
    realtime::{Broadcaster, Registry},
    session::SqliteSessions,
    AppState, Config,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url, config.db_max_connections)
        .await
        .context("failed to open database")?;

    let registry = Arc::new(Registry::new(config.ws_outbox_capacity));
    let app_state = AppState {
        db_pool: db_pool.clone(),
        sessions: Arc::new(SqliteSessions::new(db_pool)),
        hub: Broadcaster::new(registry.clone()),
    };

    let app = postchat::router(app_state).layer(cors(&config.allowed_origins)?);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(registry))
        .await?;
    Ok(())
}

fn cors(allowed_origins: &[String]) -> anyhow::Result<CorsLayer> {
    if allowed_origins.is_empty() {
        return Ok(CorsLayer::permissive());
    }

    let origins = allowed_origins
        .iter()
        .map(|origin| HeaderValue::from_str(origin).with_context(|| format!("bad origin {origin:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any))
}

async fn shutdown(registry: Arc<Registry>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    let closed = registry.close_all().await;
    tracing::info!(closed, "shutting down");
}
