//! Billing routes: debug resync and plan-change preview.

use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use turfquote_billing::ProrationPreview;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DebugSubscriptionResponse {
    /// Provider subscription id that was mirrored, or null.
    pub synced: Option<String>,
    pub message: String,
}

/// `POST /debug/subscription` - reconcile the calling user against the
/// billing provider.
pub async fn debug_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<DebugSubscriptionResponse>> {
    let outcome = state.billing.reconcile.reconcile_user(user.user_id).await?;

    Ok(Json(DebugSubscriptionResponse {
        synced: outcome.synced().map(|s| s.to_string()),
        message: outcome.describe().to_string(),
    }))
}

/// All three identifiers are mandatory; requests missing any are rejected
/// before the provider is contacted.
#[derive(Debug, Deserialize)]
pub struct PreviewPlanChangeRequest {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub new_price_id: Option<String>,
}

fn require_param(value: Option<String>, name: &str) -> ApiResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ApiError::Validation(format!("{} is required", name))),
    }
}

/// `POST /preview-plan-change` - compute a proration preview for a
/// hypothetical plan change. Mutates nothing.
pub async fn preview_plan_change(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PreviewPlanChangeRequest>,
) -> ApiResult<Json<ProrationPreview>> {
    let customer_id = require_param(body.customer_id, "customer_id")?;
    let subscription_id = require_param(body.subscription_id, "subscription_id")?;
    let new_price_id = require_param(body.new_price_id, "new_price_id")?;

    tracing::debug!(
        user_id = %user.user_id,
        customer_id = %customer_id,
        subscription_id = %subscription_id,
        new_price_id = %new_price_id,
        "Plan-change preview requested"
    );

    let preview = state
        .billing
        .preview
        .preview_plan_change(&customer_id, &subscription_id, &new_price_id)
        .await?;

    Ok(Json(preview))
}
