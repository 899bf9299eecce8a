//! HTTP routes.

pub mod admin;
pub mod billing;
pub mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .route(
            "/admin/fix-free-plan",
            post(admin::fix_free_plan).get(admin::free_plan_status),
        )
        .route("/admin/invariants", get(admin::invariant_report))
        .route("/debug/subscription", post(billing::debug_subscription))
        .route("/preview-plan-change", post(billing::preview_plan_change))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(authed)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
