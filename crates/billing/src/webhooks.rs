//! Stripe webhook handling.
//!
//! Verifies event signatures, claims exclusive processing rights through
//! the idempotency ledger, and routes subscription and price events into
//! the mirror.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use time::OffsetDateTime;

use stripe::{Event, EventObject, EventType, Subscription, Webhook};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderPrice;
use crate::store::SubscriptionStore;
use crate::sync::SubscriptionSyncService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a webhook signature timestamp, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Webhook handler for Stripe events.
pub struct WebhookHandler {
    stripe: StripeClient,
    store: Arc<dyn SubscriptionStore>,
    sync: SubscriptionSyncService,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        store: Arc<dyn SubscriptionStore>,
        sync: SubscriptionSyncService,
    ) -> Self {
        Self {
            stripe,
            store,
            sync,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Uses manual signature verification as a fallback to work around
    /// async-stripe version incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!("System time error: {}", e);
                BillingError::WebhookSignatureInvalid
            })?
            .as_secs() as i64;

        verify_signature_manual(payload, signature, webhook_secret, now)?;

        // Parse with serde directly; the stripe Event type defaults unknown
        // fields so newer API payloads still deserialize.
        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// The idempotency ledger's INSERT...ON CONFLICT claim ensures only one
    /// concurrent delivery processes a given event; duplicates return Ok
    /// without touching the mirror.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed = self
            .store
            .claim_webhook_event(&event_id, &event_type, event_timestamp)
            .await?;

        if !claimed {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event; already claimed or processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(&event).await;

        let (success, error_message) = match &result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        if let Err(e) = self
            .store
            .finish_webhook_event(&event_id, success, error_message)
            .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result; event may appear stuck"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CustomerSubscriptionCreated => {
                self.handle_subscription_event(event, true).await
            }
            EventType::CustomerSubscriptionUpdated | EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_event(event, false).await
            }
            EventType::PriceCreated | EventType::PriceUpdated => {
                let price = extract_price(event)?;
                self.store.upsert_price(ProviderPrice::from(&price)).await?;
                tracing::info!(price_id = %price.id, "Mirrored price from webhook");
                Ok(())
            }
            EventType::PriceDeleted => {
                let price = extract_price(event)?;
                self.store.deactivate_price(price.id.as_str()).await?;
                tracing::info!(price_id = %price.id, "Deactivated deleted price");
                Ok(())
            }
            _ => {
                // Track which events arrive without a handler; helps spot
                // new event types that need one.
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type"
                );
                Ok(())
            }
        }
    }

    async fn handle_subscription_event(
        &self,
        event: &Event,
        is_create_action: bool,
    ) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        self.sync
            .upsert_subscription(subscription.id.as_str(), &customer_id, is_create_action)
            .await?;

        Ok(())
    }
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        other => Err(BillingError::Internal(format!(
            "expected subscription object in {} event, got {:?}",
            event.type_, other
        ))),
    }
}

fn extract_price(event: &Event) -> BillingResult<stripe::Price> {
    match &event.data.object {
        EventObject::Price(price) => Ok(price.clone()),
        other => Err(BillingError::Internal(format!(
            "expected price object in {} event, got {:?}",
            event.type_, other
        ))),
    }
}

/// Manual `Stripe-Signature` verification.
///
/// Header format: `t=timestamp,v1=signature[,v0=...]`. The signed payload
/// is `{timestamp}.{body}` HMAC-SHA256'd with the endpoint secret.
fn verify_signature_manual(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}
