//! HTTP routes

pub mod billing;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::require_auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Webhook and public checkout authenticate by other means (signature,
    // nothing); everything else needs a bearer token.
    let protected = Router::new()
        .route("/checkout", post(billing::create_checkout))
        .route("/subscription/status", get(billing::subscription_status))
        .route("/subscription/sync", post(billing::sync_subscription))
        .route("/subscription/cancel", post(billing::cancel_subscription))
        .route("/subscription/resume", post(billing::resume_subscription))
        .route("/subscription/invariants", get(billing::check_invariants))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(billing::webhook))
        .route("/checkout/public", post(billing::create_public_checkout))
        .merge(protected)
        .with_state(state)
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
