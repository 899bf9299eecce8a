//! Reconciliation scanner: detect and repair drift between the provider's
//! subscription list and the local mirror.
//!
//! Invoked on demand (debug/admin trigger), not on a schedule. The only
//! repair it performs itself is mirroring a provider-active subscription
//! the local store has never seen; everything else is reported, not
//! guessed at.

use std::collections::HashSet;
use std::sync::Arc;

use turfquote_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::SubscriptionStore;
use crate::sync::SubscriptionSyncService;

/// Result of scanning one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The user has no billing customer (free-plan only); the provider was
    /// not contacted.
    NoCustomer,
    /// Provider and mirror agree; nothing written.
    InSync,
    /// One provider-active subscription had no local row and was mirrored.
    Repaired { subscription_id: String },
}

impl ReconcileOutcome {
    /// The repaired subscription id, if a repair happened.
    pub fn synced(&self) -> Option<&str> {
        match self {
            ReconcileOutcome::Repaired { subscription_id } => Some(subscription_id),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ReconcileOutcome::NoCustomer => {
                "no billing customer exists for this user; nothing to sync"
            }
            ReconcileOutcome::InSync => "local subscriptions match the billing provider",
            ReconcileOutcome::Repaired { .. } => "synced a missing subscription from the provider",
        }
    }
}

/// Scans users for provider/mirror drift.
#[derive(Clone)]
pub struct ReconciliationService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    customers: CustomerService,
    sync: SubscriptionSyncService,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        customers: CustomerService,
        sync: SubscriptionSyncService,
    ) -> Self {
        Self {
            store,
            provider,
            customers,
            sync,
        }
    }

    /// Compare the provider's subscriptions for a user against local rows
    /// and mirror a missing active subscription.
    ///
    /// Users with no customer mapping short-circuit before any provider
    /// call. If more than one provider-active subscription is unmirrored,
    /// the provider itself is inconsistent and the scan fails with
    /// `ProviderStateConflict` rather than picking one.
    pub async fn reconcile_user(&self, user_id: Uuid) -> BillingResult<ReconcileOutcome> {
        let customer_id = match self.customers.lookup(user_id).await? {
            Some(id) => id,
            None => {
                tracing::debug!(user_id = %user_id, "No billing customer; skipping reconcile");
                return Ok(ReconcileOutcome::NoCustomer);
            }
        };

        let provider_subs = self.provider.list_subscriptions(&customer_id).await?;
        let local_subs = self.store.subscriptions_for_user(user_id).await?;

        let local_ids: HashSet<&str> = local_subs
            .iter()
            .filter_map(|s| s.stripe_subscription_id.as_deref())
            .collect();

        let unmatched_active: Vec<&str> = provider_subs
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter(|s| !local_ids.contains(s.id.as_str()))
            .map(|s| s.id.as_str())
            .collect();

        match unmatched_active.as_slice() {
            [] => {
                tracing::debug!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    provider_count = provider_subs.len(),
                    local_count = local_subs.len(),
                    "No drift detected"
                );
                Ok(ReconcileOutcome::InSync)
            }
            [subscription_id] => {
                tracing::info!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    subscription_id = %subscription_id,
                    "Provider-active subscription missing locally; repairing"
                );
                let record = self
                    .sync
                    .upsert_subscription(subscription_id, &customer_id, false)
                    .await?;
                Ok(ReconcileOutcome::Repaired {
                    subscription_id: record
                        .stripe_subscription_id
                        .unwrap_or_else(|| subscription_id.to_string()),
                })
            }
            many => {
                tracing::error!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    count = many.len(),
                    subscription_ids = ?many,
                    "Multiple unmatched active subscriptions at provider; refusing to guess"
                );
                Err(BillingError::ProviderStateConflict {
                    customer_id,
                    count: many.len(),
                })
            }
        }
    }
}
