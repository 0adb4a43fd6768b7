//! API Surface (spec.md §6): HTTP ingress translating requests into calls
//! on the scheduler, registry and reconciler.

mod auth;
mod error;
mod handlers;
mod state;

use std::time::Duration;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/functions/:id/invoke", post(handlers::invoke_by_id))
        .route("/api/functions/name/:name/invoke", post(handlers::invoke_by_name))
        .route("/api/executions/:id", get(handlers::get_execution))
        .route("/api/executions/function/:id", get(handlers::list_executions_for_function))
        .route("/api/vms", get(handlers::list_vms))
        .route("/api/vms/register", post(handlers::register_vm))
        .route("/api/results", post(handlers::receive_result))
        .route("/api/functions", post(handlers::register_function).get(handlers::list_functions))
        .route("/api/functions/:id", get(handlers::get_function).delete(handlers::delete_function))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer_token));

    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/pool/stats", get(handlers::pool_stats))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
}
