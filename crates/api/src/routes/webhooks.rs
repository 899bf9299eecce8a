//! Stripe webhook endpoint.
//!
//! Unauthenticated; trust comes from the signature check. Handler errors
//! return 500 so Stripe retries the delivery.

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// `POST /webhooks/stripe`
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Validation("missing Stripe-Signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;

    state.billing.webhooks.handle_event(event).await?;

    Ok(Json(json!({ "received": true })))
}
