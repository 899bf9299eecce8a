//! Subscription upsert: mirror one provider subscription into the local
//! store.
//!
//! The provider is authoritative. Every path (webhook delivery, debug
//! resync, reconciliation repair) re-fetches the subscription rather than
//! trusting a payload, then writes with upsert semantics keyed on the
//! external subscription id, so replaying the same provider state is a
//! no-op.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::{SubscriptionRecord, SubscriptionStore, SubscriptionWrite};

/// Mirrors provider subscriptions into the local store.
#[derive(Clone)]
pub struct SubscriptionSyncService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
}

impl SubscriptionSyncService {
    pub fn new(store: Arc<dyn SubscriptionStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { store, provider }
    }

    /// Fetch the authoritative subscription and upsert the local mirror.
    ///
    /// `is_create_action` marks first-time creation (checkout webhook): the
    /// customer mapping is ensured before the subscription row so the
    /// foreign ordering holds even when the mapping insert has not landed
    /// yet. A provider-side 404 surfaces as `SubscriptionMissing`; store
    /// failures propagate so callers never see unpersisted state as
    /// success.
    pub async fn upsert_subscription(
        &self,
        subscription_id: &str,
        customer_id: &str,
        is_create_action: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let subscription = self.provider.fetch_subscription(subscription_id).await?;

        if subscription.customer_id != customer_id {
            tracing::warn!(
                subscription_id = %subscription_id,
                expected_customer = %customer_id,
                provider_customer = %subscription.customer_id,
                "Provider subscription belongs to a different customer than the caller claimed"
            );
        }

        let user_id = self
            .resolve_user(&subscription.customer_id, subscription.user_id(), is_create_action)
            .await?;

        let metadata = serde_json::to_value(&subscription.metadata)
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        let record = self
            .store
            .upsert_subscription(SubscriptionWrite {
                user_id,
                stripe_subscription_id: subscription.id.clone(),
                stripe_customer_id: subscription.customer_id.clone(),
                status: subscription.status,
                stripe_price_id: subscription.price_id.clone(),
                current_period_start: subscription.current_period_start,
                current_period_end: subscription.current_period_end,
                cancel_at_period_end: subscription.cancel_at_period_end,
                canceled_at: subscription.canceled_at,
                metadata,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.stripe_subscription_id.as_deref().unwrap_or("-"),
            status = %record.status,
            is_create_action = is_create_action,
            "Synced subscription from provider"
        );

        Ok(record)
    }

    /// Find the owning user for a provider customer, inserting the mapping
    /// on create actions when the subscription metadata names the user.
    async fn resolve_user(
        &self,
        customer_id: &str,
        metadata_user: Option<Uuid>,
        is_create_action: bool,
    ) -> BillingResult<Uuid> {
        if let Some(user_id) = self.store.user_for_customer(customer_id).await? {
            return Ok(user_id);
        }

        if is_create_action {
            if let Some(user_id) = metadata_user {
                self.store.persist_customer(user_id, customer_id).await?;
                tracing::info!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    "Created customer mapping from subscription metadata"
                );
                return Ok(user_id);
            }
        }

        Err(BillingError::CustomerNotFound(customer_id.to_string()))
    }
}
