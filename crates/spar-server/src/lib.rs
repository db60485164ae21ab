//! HTTP boundary for the Spar pipeline
//!
//! A thin axum translation over [`spar_pipeline::Ops`]: JSON in, JSON out,
//! events by long-poll or SSE. Conversation semantics live in the pipeline;
//! this crate only decodes requests, maps errors to statuses and shapes
//! responses.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use spar_core::Result;
use spar_pipeline::Ops;

pub mod error;
pub mod routes;
pub mod stream;

pub use error::ApiError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub ops: Arc<Ops>,
}

/// The full route table.
pub fn router(ops: Arc<Ops>) -> Router {
    Router::new()
        .route("/health", get(routes::handle_health))
        .route("/api/categories", get(routes::handle_categories))
        .route("/api/conversations", post(routes::handle_start_conversation))
        .route(
            "/api/conversations/:conversation_id",
            get(routes::handle_get_conversation),
        )
        .route(
            "/api/conversations/:conversation_id/turns",
            post(routes::handle_submit_turn),
        )
        .route(
            "/api/conversations/:conversation_id/events",
            get(routes::handle_pull_events),
        )
        .route(
            "/api/conversations/:conversation_id/events/stream",
            get(stream::handle_stream_events),
        )
        .route(
            "/api/conversations/:conversation_id/end",
            post(routes::handle_end_conversation),
        )
        .route("/api/turns/:turn_id/rollback", post(routes::handle_rollback))
        .route(
            "/api/turns/:turn_id/speech",
            post(routes::handle_synthesize_turn),
        )
        .route(
            "/api/turns/:turn_id/analysis",
            post(routes::handle_analyze_turn),
        )
        .layer(CorsLayer::permissive())
        .with_state(AppState { ops })
}

/// Bind the configured address and serve until the surrounding task stops.
pub async fn serve(ops: Arc<Ops>) -> Result<()> {
    let bind = ops.config().api.bind.clone();
    let app = router(ops);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}
