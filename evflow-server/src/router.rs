//! Router construction for the workflow engine's REST approval surface.

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health::healthz))
        .route("/approvals", get(handlers::approvals::list_pending))
        .route("/approvals/summary", get(handlers::approvals::summary))
        .route(
            "/approvals/:gate_id",
            get(handlers::approvals::get_gate).post(handlers::approvals::resolve_gate).delete(handlers::approvals::cancel_gate),
        )
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
