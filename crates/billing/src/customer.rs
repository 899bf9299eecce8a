//! Customer resolution.
//!
//! Maps a local user to a provider-side billing customer. The mapping is
//! created lazily, only once a user actually enters a paid flow; a
//! free-plan-only user has no mapping at all, and `lookup` reports that
//! distinctly instead of fabricating a customer.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::BillingResult;
use crate::provider::BillingProvider;
use crate::store::SubscriptionStore;

/// Resolves local users to provider customers.
#[derive(Clone)]
pub struct CustomerService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
}

impl CustomerService {
    pub fn new(store: Arc<dyn SubscriptionStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { store, provider }
    }

    /// The user's provider customer id, if one exists.
    ///
    /// Pure store read; never touches the provider. `None` means the user
    /// has never needed a billing customer (free-plan-only) and callers
    /// should short-circuit rather than create one.
    pub async fn lookup(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        self.store.customer_for_user(user_id).await
    }

    /// Return the existing mapping or create a provider customer and
    /// persist it.
    ///
    /// Two concurrent calls for the same user both return the same id: the
    /// losing insert resolves to the winner's mapping, and the extra
    /// provider customer is logged for manual cleanup.
    pub async fn ensure(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        if let Some(existing) = self.store.customer_for_user(user_id).await? {
            return Ok(existing);
        }

        let created = self.provider.create_customer(user_id, email).await?;
        let persisted = self.store.persist_customer(user_id, &created).await?;

        if persisted != created {
            tracing::warn!(
                user_id = %user_id,
                created_customer_id = %created,
                winning_customer_id = %persisted,
                "Lost customer creation race; provider customer is orphaned"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                customer_id = %persisted,
                "Resolved billing customer"
            );
        }

        Ok(persisted)
    }
}
