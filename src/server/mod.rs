//! HTTP boundary: management API for the stores plus the mock endpoints.

pub mod error;
mod routes;

use crate::engine::MockEngine;
use axum::routing::{any, get, post, put};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::AppError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MockEngine>,
}

impl AppState {
    pub fn new(engine: Arc<MockEngine>) -> Self {
        Self { engine }
    }
}

/// Build the router with every API route.
pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        // Triggers
        .route(
            "/api/triggers",
            get(routes::list_triggers).post(routes::add_trigger),
        )
        .route(
            "/api/triggers/{id}",
            get(routes::get_trigger)
                .put(routes::update_trigger)
                .delete(routes::delete_trigger),
        )
        // Templates
        .route(
            "/api/templates",
            get(routes::list_templates).post(routes::add_template),
        )
        .route(
            "/api/templates/{id}",
            get(routes::get_template)
                .put(routes::update_template)
                .delete(routes::delete_template),
        )
        .route("/api/templates/{id}/process", any(routes::process_template))
        .route(
            "/api/templates/{id}/process/{*rest}",
            any(routes::process_template),
        )
        // Scenario steps
        .route("/api/steps", post(routes::add_step))
        .route(
            "/api/steps/{id}",
            put(routes::update_step).delete(routes::delete_step),
        )
        .route(
            "/api/steps/field/triggerId/{trigger_id}",
            get(routes::get_steps).put(routes::replace_steps),
        )
        // Mock endpoint
        .route("/api/http/process", any(routes::process_http))
        .route("/api/http/process/{*rest}", any(routes::process_http))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app_state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "Mock server listening");
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
