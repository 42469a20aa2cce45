//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (raw body, shared state)
//! 2. Hands the event to the router
//! 3. Returns HTTP response (JSON, status code)

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{db::EntityStore, middleware, services::router::EventRouter};

/// Health check endpoint
pub mod health;
/// Card provider webhook ingestion
pub mod webhooks;

/// State shared with every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub router: Arc<EventRouter>,
    pub signing_secret: Arc<str>,
}

/// Build the HTTP application.
///
/// - `GET /health` is public
/// - `POST /webhooks/card-provider` requires a valid body signature
pub fn routes(state: AppState) -> Router {
    let signed_routes = Router::new()
        .route("/webhooks/card-provider", post(webhooks::ingest))
        // Reject unsigned deliveries before the body is parsed
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::signature::verify_signature,
        ));

    Router::new()
        .route("/health", get(health::health_check))
        .merge(signed_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
