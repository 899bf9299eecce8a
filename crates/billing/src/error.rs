//! Billing error types.

use thiserror::Error;

/// Errors surfaced by the billing subsystem.
///
/// Provider and store failures always carry the underlying message; callers
/// decide whether a failure is benign (e.g. `SubscriptionMissing` during a
/// resync) but never receive a fabricated success.
#[derive(Debug, Error)]
pub enum BillingError {
    /// The Stripe API call itself failed (network, auth, validation).
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    /// The referenced subscription no longer exists at the provider.
    /// Recoverable: the object may have been deleted out-of-band.
    #[error("subscription {0} not found at the billing provider")]
    SubscriptionMissing(String),

    /// No customer mapping exists for the given provider customer id.
    #[error("no billing customer mapping for {0}")]
    CustomerNotFound(String),

    /// A referenced local entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider reports more than one active subscription with no local
    /// mirror; repairing would require guessing which one to sync.
    #[error("provider reports {count} unmatched active subscriptions for customer {customer_id}")]
    ProviderStateConflict { customer_id: String, count: usize },

    /// A local store read or write failed. Fatal to the calling operation.
    #[error("database error: {0}")]
    Database(String),

    /// Missing or malformed configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Webhook payload failed signature verification.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_customer() {
        let err = BillingError::ProviderStateConflict {
            customer_id: "cus_abc".to_string(),
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("cus_abc"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_subscription_missing_is_distinct_from_api_error() {
        let missing = BillingError::SubscriptionMissing("sub_1".to_string());
        assert!(matches!(missing, BillingError::SubscriptionMissing(_)));
        let api = BillingError::StripeApi("boom".to_string());
        assert!(!matches!(api, BillingError::SubscriptionMissing(_)));
    }
}
