//! Axum server setup and router construction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use recap::coordinator::ContextCache;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::api::{self, AppState};

/// Build the full axum router.
///
/// The router serves:
/// - `POST|GET|DELETE /api/conversations/{id}/context`
/// - `GET /api/stats`
pub fn build_router(cache: Arc<ContextCache>) -> Router {
    let app_state = AppState { cache };

    // CORS layer for browser callers on a different origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/conversations/{id}/context",
            post(api::post_context)
                .get(api::get_context)
                .delete(api::delete_context),
        )
        .route("/api/stats", get(api::get_stats))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Bind `bind_addr`, serve `router` on a Tokio task and return the bound
/// address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("server on {addr} stopped: {e}");
        }
    });

    Ok(addr)
}

/// Periodically drop expired cache entries.
pub fn spawn_purge_task(cache: Arc<ContextCache>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let removed = cache.purge_expired();
            if removed > 0 {
                debug!(removed, "periodic purge");
            }
        }
    });
}
