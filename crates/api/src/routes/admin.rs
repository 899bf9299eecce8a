//! Platform admin routes.
//!
//! Protected by the admin role check on top of session authentication.

use axum::{extract::State, Extension, Json};
use serde::Serialize;
use serde_json::json;
use turfquote_billing::InvariantCheckSummary;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct FixFreePlanResponse {
    /// Price id that was activated, or null when no repair was needed.
    pub activated_price_id: Option<String>,
}

/// `POST /admin/fix-free-plan` - repair the zero-amount price mirrors so
/// exactly one is active.
pub async fn fix_free_plan(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<FixFreePlanResponse>> {
    user.require_admin()?;

    let activated_price_id = state.billing.free_plan.ensure_free_price_active().await?;

    tracing::info!(
        admin_user_id = %user.user_id,
        activated_price_id = ?activated_price_id,
        "Admin triggered free-price repair"
    );

    Ok(Json(FixFreePlanResponse { activated_price_id }))
}

/// `GET /admin/fix-free-plan` - read-only free-price health report.
pub async fn free_plan_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    user.require_admin()?;

    let health = state.billing.free_plan.free_price_health().await?;
    let status = if health.is_healthy() {
        "healthy"
    } else {
        "needs_fix"
    };

    Ok(Json(json!({
        "status": status,
        "zero_amount_prices": health.zero_amount_prices,
        "active": health.active,
    })))
}

/// `GET /admin/invariants` - run all billing consistency checks.
pub async fn invariant_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    user.require_admin()?;

    let summary = state.billing.invariants.run_all_checks().await?;

    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Billing invariant check found violations"
        );
    }

    Ok(Json(summary))
}
