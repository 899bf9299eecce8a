//! Plan-change proration preview.
//!
//! A pure provider read: the service deliberately holds no store handle,
//! so previewing cannot mutate local state by construction.

use std::sync::Arc;

use crate::error::BillingResult;
use crate::provider::{BillingProvider, ProrationPreview};

/// Computes proration previews for hypothetical plan changes.
#[derive(Clone)]
pub struct PlanChangePreviewService {
    provider: Arc<dyn BillingProvider>,
}

impl PlanChangePreviewService {
    pub fn new(provider: Arc<dyn BillingProvider>) -> Self {
        Self { provider }
    }

    /// Ask the provider what a swap to `new_price_id` would cost right now.
    ///
    /// Nothing is committed on either side. Provider errors (unknown price,
    /// missing subscription, outage) surface with the provider's message
    /// attached; no preview is ever fabricated.
    pub async fn preview_plan_change(
        &self,
        customer_id: &str,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        let preview = self
            .provider
            .preview_proration(customer_id, subscription_id, new_price_id)
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            new_price_id = %new_price_id,
            amount_due_cents = preview.amount_due_cents,
            "Computed plan-change preview"
        );

        Ok(preview)
    }
}
