//! Free-plan guarantees.
//!
//! Two repairs keep the free tier coherent: exactly one zero-amount price
//! mirror stays active (provider-side price rotation can deactivate it),
//! and a user selecting the free plan gets exactly one synthetic local
//! subscription row with no provider identifiers.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{
    FreePriceHealth, FreeSubscriptionWrite, SubscriptionRecord, SubscriptionStore,
};

/// Metadata key tagging a row as a free-plan grant.
pub const PLAN_TYPE_KEY: &str = "plan_type";
/// Metadata value for free-plan grants.
pub const PLAN_TYPE_FREE: &str = "free";

/// Synthetic billing period granted to free-plan rows.
const FREE_PERIOD_DAYS: i64 = 365;

/// Guards the free-plan invariants.
#[derive(Clone)]
pub struct FreePlanService {
    store: Arc<dyn SubscriptionStore>,
}

impl FreePlanService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Repair the zero-amount price mirrors so exactly one is active.
    ///
    /// Returns the price id that was activated, or `None` when nothing
    /// needed fixing. Idempotent: a second call right after a repair is a
    /// no-op.
    pub async fn ensure_free_price_active(&self) -> BillingResult<Option<String>> {
        let activated = self.store.activate_newest_free_price().await?;

        match &activated {
            Some(price_id) => {
                tracing::info!(price_id = %price_id, "Activated newest zero-amount price");
            }
            None => {
                tracing::debug!("Free price mirrors already healthy");
            }
        }

        Ok(activated)
    }

    /// Read-only health report for the zero-amount price mirrors.
    pub async fn free_price_health(&self) -> BillingResult<FreePriceHealth> {
        self.store.free_price_health().await
    }

    /// Grant the user a free-plan subscription, or return the current row
    /// they already have.
    ///
    /// Never creates a second current row: the existence check and the
    /// insert are one logical unit, arbitrated by the store's
    /// single-current-row constraint, so two tabs racing on plan selection
    /// converge on the same row.
    pub async fn create_free_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(existing) = self.store.current_subscription(user_id).await? {
            tracing::debug!(
                user_id = %user_id,
                subscription_id = %existing.id,
                "User already has a current subscription; not granting free plan"
            );
            return Ok(existing);
        }

        let now = OffsetDateTime::now_utc();
        let record = self
            .store
            .insert_free_subscription(FreeSubscriptionWrite {
                user_id,
                current_period_start: now,
                current_period_end: now + Duration::days(FREE_PERIOD_DAYS),
                metadata: serde_json::json!({ PLAN_TYPE_KEY: PLAN_TYPE_FREE }),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.id,
            "Granted free-plan subscription"
        );

        Ok(record)
    }
}
