//! Billing provider seam.
//!
//! `BillingProvider` is the narrow surface the reconciliation code needs
//! from Stripe: customer creation, subscription reads, and the proration
//! preview. Production uses [`StripeProvider`]; tests swap in an in-memory
//! double so provider-call counts can be asserted.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use turfquote_shared::SubscriptionStatus;
use uuid::Uuid;

use stripe::{
    CreateCustomer, Customer, CustomerId, ListSubscriptions, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, SubscriptionStatusFilter,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Metadata key the provider objects carry to link back to a local user.
pub const METADATA_USER_ID: &str = "user_id";

/// A subscription as reported by the provider, with price expansion applied.
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: HashMap<String, String>,
}

impl ProviderSubscription {
    /// Local user id carried in provider metadata, if any.
    pub fn user_id(&self) -> Option<Uuid> {
        self.metadata
            .get(METADATA_USER_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
    }
}

/// A price as reported by the provider, for the local mirror.
#[derive(Debug, Clone)]
pub struct ProviderPrice {
    pub id: String,
    pub unit_amount: Option<i64>,
    pub currency: String,
    pub recurring_interval: Option<String>,
    pub active: bool,
    pub created: OffsetDateTime,
}

/// Preview of proration for a hypothetical plan change.
///
/// Computed entirely by the provider; nothing local or remote is mutated.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProrationPreview {
    pub customer_id: String,
    pub subscription_id: String,
    pub new_price_id: String,
    /// Amount that would be due immediately, in cents (negative = credit).
    pub amount_due_cents: i64,
    pub currency: String,
    /// Days remaining in the current billing period.
    pub days_remaining: i32,
    /// Human-readable description of the preview.
    pub description: String,
}

/// Narrow provider surface used by the reconciliation subsystem.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a provider-side customer for a local user.
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String>;

    /// Fetch one subscription by id, with price expansion.
    ///
    /// A provider-side 404 is reported as `SubscriptionMissing`, distinct
    /// from other API failures.
    async fn fetch_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// List all subscriptions for a customer, across every status.
    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>>;

    /// Ask the provider to price a hypothetical swap to `new_price_id`.
    async fn preview_proration(
        &self,
        customer_id: &str,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationPreview>;
}

/// Production provider backed by the Stripe API.
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
        customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }
}

/// Map a provider status onto the locally stored enum, verbatim.
///
/// `paused` is the one status the product does not sell; it is recorded as
/// `canceled` so entitlement checks treat the user as non-paying.
fn map_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Paused => {
            tracing::warn!("Mapping provider status 'paused' to 'canceled'");
            SubscriptionStatus::Canceled
        }
    }
}

fn timestamp(t: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(t).unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn convert_subscription(subscription: &Subscription) -> ProviderSubscription {
    let customer_id = match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|p| p.id.to_string());

    ProviderSubscription {
        id: subscription.id.to_string(),
        customer_id,
        status: map_status(subscription.status),
        price_id,
        current_period_start: timestamp(subscription.current_period_start),
        current_period_end: timestamp(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        canceled_at: subscription.canceled_at.map(timestamp),
        metadata: subscription.metadata.clone(),
    }
}

impl From<&stripe::Price> for ProviderPrice {
    fn from(price: &stripe::Price) -> Self {
        ProviderPrice {
            id: price.id.to_string(),
            unit_amount: price.unit_amount,
            currency: price
                .currency
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "usd".to_string()),
            recurring_interval: price.recurring.as_ref().map(|r| r.interval.to_string()),
            active: price.active.unwrap_or(false),
            created: price
                .created
                .map(timestamp)
                .unwrap_or_else(OffsetDateTime::now_utc),
        }
    }
}

#[async_trait]
impl BillingProvider for StripeProvider {
    async fn create_customer(&self, user_id: Uuid, email: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), user_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let subscription =
            Subscription::retrieve(self.stripe.inner(), &sub_id, &["items.data.price"])
                .await
                .map_err(|e| match e {
                    stripe::StripeError::Stripe(ref req) if req.http_status == 404 => {
                        BillingError::SubscriptionMissing(subscription_id.to_string())
                    }
                    other => BillingError::StripeApi(other.to_string()),
                })?;

        Ok(convert_subscription(&subscription))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        let customer = Self::parse_customer_id(customer_id)?;

        let mut params = ListSubscriptions::new();
        params.customer = Some(customer);
        // Default listing omits canceled subscriptions; reconciliation needs
        // every status to compare against local rows.
        params.status = Some(SubscriptionStatusFilter::All);
        params.limit = Some(100);

        let list = Subscription::list(self.stripe.inner(), &params).await?;

        Ok(list.data.iter().map(convert_subscription).collect())
    }

    async fn preview_proration(
        &self,
        customer_id: &str,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        // The current item id is required to express the swap.
        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[])
            .await
            .map_err(|e| match e {
                stripe::StripeError::Stripe(ref req) if req.http_status == 404 => {
                    BillingError::SubscriptionMissing(subscription_id.to_string())
                }
                other => BillingError::StripeApi(other.to_string()),
            })?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        // async-stripe 0.39 has no binding for POST /invoices/create_preview
        // (the GET /invoices/upcoming it wraps is deprecated), so call it
        // directly with Stripe's nested form-parameter encoding.
        let form_params = [
            ("customer", customer_id),
            ("subscription", subscription_id),
            ("subscription_details[items][0][id]", item_id.as_str()),
            ("subscription_details[items][0][price]", new_price_id),
            (
                "subscription_details[proration_behavior]",
                "create_prorations",
            ),
        ];

        let client = reqwest::Client::new();
        let response = client
            .post("https://api.stripe.com/v1/invoices/create_preview")
            .bearer_auth(&self.stripe.config().secret_key)
            .form(&form_params)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                error_body = %error_body,
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Stripe invoices/create_preview API failed"
            );
            return Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status, error_body
            )));
        }

        let upcoming_invoice: serde_json::Value = response.json().await.map_err(|e| {
            BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e))
        })?;

        let amount_due = upcoming_invoice["amount_due"].as_i64().unwrap_or(0);
        let currency = upcoming_invoice["currency"]
            .as_str()
            .unwrap_or("usd")
            .to_string();

        let period_end = current.current_period_end;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let days_remaining = ((period_end - now) as f64 / 86400.0).ceil() as i32;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            new_price_id = %new_price_id,
            amount_due = amount_due,
            days_remaining = days_remaining,
            "Previewed plan change proration"
        );

        Ok(ProrationPreview {
            customer_id: customer_id.to_string(),
            subscription_id: subscription_id.to_string(),
            new_price_id: new_price_id.to_string(),
            amount_due_cents: amount_due,
            currency,
            days_remaining,
            description: format!(
                "Switch to {} with {} days remaining in the current period",
                new_price_id, days_remaining
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_verbatim() {
        assert_eq!(
            map_status(StripeSubStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::IncompleteExpired
        );
        assert_eq!(
            map_status(StripeSubStatus::PastDue),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_status(StripeSubStatus::Unpaid),
            SubscriptionStatus::Unpaid
        );
    }

    #[test]
    fn test_paused_collapses_to_canceled() {
        assert_eq!(
            map_status(StripeSubStatus::Paused),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_metadata_user_id_parsing() {
        let user_id = Uuid::new_v4();
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_USER_ID.to_string(), user_id.to_string());

        let sub = ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: SubscriptionStatus::Active,
            price_id: None,
            current_period_start: OffsetDateTime::now_utc(),
            current_period_end: OffsetDateTime::now_utc(),
            cancel_at_period_end: false,
            canceled_at: None,
            metadata,
        };
        assert_eq!(sub.user_id(), Some(user_id));

        let no_meta = ProviderSubscription {
            metadata: HashMap::new(),
            ..sub
        };
        assert_eq!(no_meta.user_id(), None);
    }
}
