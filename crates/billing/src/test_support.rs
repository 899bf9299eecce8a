//! In-memory doubles for the store and provider seams.
//!
//! `MemoryStore` mirrors the Postgres implementation's semantics closely
//! enough for the consistency properties to be exercised: the
//! single-current-row constraint, insert-race resolution, and the
//! exactly-one-active free price repair. `MockProvider` counts calls so
//! tests can assert the provider was (or was not) contacted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use turfquote_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, ProrationPreview, ProviderPrice, ProviderSubscription};
use crate::store::{
    FreePriceHealth, FreeSubscriptionWrite, SubscriptionRecord, SubscriptionStore,
    SubscriptionWrite,
};

#[derive(Default)]
struct MemoryInner {
    customers: HashMap<Uuid, String>,
    subscriptions: Vec<SubscriptionRecord>,
    prices: Vec<ProviderPrice>,
    webhook_events: HashMap<String, String>,
}

/// In-memory `SubscriptionStore`.
#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<MemoryInner>,
    write_ops: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating store operations performed.
    pub fn write_ops(&self) -> usize {
        self.write_ops.load(Ordering::SeqCst)
    }

    pub fn customer_count(&self) -> usize {
        self.inner.lock().unwrap().customers.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }

    pub fn all_subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.inner.lock().unwrap().subscriptions.clone()
    }

    pub fn active_free_prices(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .prices
            .iter()
            .filter(|p| p.unit_amount == Some(0) && p.active)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Seed a customer mapping without going through the provider.
    pub fn seed_customer(&self, user_id: Uuid, customer_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .customers
            .insert(user_id, customer_id.to_string());
    }

    /// Seed a subscription row directly.
    pub fn seed_subscription(
        &self,
        user_id: Uuid,
        stripe_subscription_id: Option<&str>,
        status: SubscriptionStatus,
    ) {
        let now = OffsetDateTime::now_utc();
        self.inner.lock().unwrap().subscriptions.push(SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id,
            stripe_subscription_id: stripe_subscription_id.map(|s| s.to_string()),
            stripe_customer_id: None,
            status,
            stripe_price_id: None,
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            cancel_at_period_end: false,
            canceled_at: if status == SubscriptionStatus::Canceled {
                Some(now)
            } else {
                None
            },
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        });
    }

    /// Seed a price mirror.
    pub fn seed_price(&self, id: &str, unit_amount: i64, active: bool, created_offset_days: i64) {
        self.inner.lock().unwrap().prices.push(ProviderPrice {
            id: id.to_string(),
            unit_amount: Some(unit_amount),
            currency: "usd".to_string(),
            recurring_interval: Some("month".to_string()),
            active,
            created: OffsetDateTime::now_utc() - Duration::days(created_offset_days),
        });
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.inner.lock().unwrap().customers.get(&user_id).cloned())
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .customers
            .iter()
            .find(|(_, c)| c.as_str() == customer_id)
            .map(|(u, _)| *u))
    }

    async fn persist_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<String> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .customers
            .entry(user_id)
            .or_insert_with(|| customer_id.to_string())
            .clone())
    }

    async fn upsert_subscription(
        &self,
        write: SubscriptionWrite,
    ) -> BillingResult<SubscriptionRecord> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let now = OffsetDateTime::now_utc();

        if write.status.is_current() {
            // Free grants are superseded by a current paid subscription.
            for row in inner.subscriptions.iter_mut() {
                if row.user_id == write.user_id
                    && row.stripe_subscription_id.is_none()
                    && row.status.is_current()
                {
                    row.status = SubscriptionStatus::Canceled;
                    row.canceled_at = Some(now);
                    row.updated_at = now;
                }
            }

            // Partial unique index: one current row per user.
            let conflicting = inner.subscriptions.iter().any(|row| {
                row.user_id == write.user_id
                    && row.status.is_current()
                    && row.stripe_subscription_id.as_deref()
                        != Some(write.stripe_subscription_id.as_str())
            });
            if conflicting {
                return Err(BillingError::Database(
                    "duplicate key value violates unique constraint \
                     \"uniq_current_subscription_per_user\""
                        .to_string(),
                ));
            }
        }

        if let Some(row) = inner
            .subscriptions
            .iter_mut()
            .find(|r| r.stripe_subscription_id.as_deref() == Some(write.stripe_subscription_id.as_str()))
        {
            row.user_id = write.user_id;
            row.stripe_customer_id = Some(write.stripe_customer_id.clone());
            row.status = write.status;
            row.stripe_price_id = write.stripe_price_id.clone();
            row.current_period_start = write.current_period_start;
            row.current_period_end = write.current_period_end;
            row.cancel_at_period_end = write.cancel_at_period_end;
            row.canceled_at = write.canceled_at;
            row.metadata = write.metadata.clone();
            row.updated_at = now;
            return Ok(row.clone());
        }

        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: write.user_id,
            stripe_subscription_id: Some(write.stripe_subscription_id),
            stripe_customer_id: Some(write.stripe_customer_id),
            status: write.status,
            stripe_price_id: write.stripe_price_id,
            current_period_start: write.current_period_start,
            current_period_end: write.current_period_end,
            cancel_at_period_end: write.cancel_at_period_end,
            canceled_at: write.canceled_at,
            metadata: write.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .find(|r| r.user_id == user_id && r.status.is_current())
            .cloned())
    }

    async fn subscriptions_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_free_subscription(
        &self,
        write: FreeSubscriptionWrite,
    ) -> BillingResult<SubscriptionRecord> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        // One lock held for check + insert: this is the "single logical
        // unit" the Postgres partial unique index provides.
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner
            .subscriptions
            .iter()
            .find(|r| r.user_id == write.user_id && r.status.is_current())
        {
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: write.user_id,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            status: SubscriptionStatus::Active,
            stripe_price_id: None,
            current_period_start: write.current_period_start,
            current_period_end: write.current_period_end,
            cancel_at_period_end: false,
            canceled_at: None,
            metadata: write.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn upsert_price(&self, price: ProviderPrice) -> BillingResult<()> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.prices.iter_mut().find(|p| p.id == price.id) {
            *existing = price;
        } else {
            inner.prices.push(price);
        }
        Ok(())
    }

    async fn deactivate_price(&self, price_id: &str) -> BillingResult<()> {
        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if let Some(price) = inner.prices.iter_mut().find(|p| p.id == price_id) {
            price.active = false;
        }
        Ok(())
    }

    async fn activate_newest_free_price(&self) -> BillingResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();

        let mut free: Vec<usize> = inner
            .prices
            .iter()
            .enumerate()
            .filter(|(_, p)| p.unit_amount == Some(0))
            .map(|(i, _)| i)
            .collect();
        if free.is_empty() {
            return Ok(None);
        }

        free.sort_by(|a, b| {
            let pa = &inner.prices[*a];
            let pb = &inner.prices[*b];
            pb.created.cmp(&pa.created).then(pa.id.cmp(&pb.id))
        });

        let active_count = free
            .iter()
            .filter(|i| inner.prices[**i].active)
            .count();
        if active_count == 1 {
            return Ok(None);
        }

        self.write_ops.fetch_add(1, Ordering::SeqCst);
        let newest_idx = free[0];
        let newest_id = inner.prices[newest_idx].id.clone();
        for i in free {
            inner.prices[i].active = i == newest_idx;
        }
        Ok(Some(newest_id))
    }

    async fn free_price_health(&self) -> BillingResult<FreePriceHealth> {
        let inner = self.inner.lock().unwrap();
        let zero: Vec<_> = inner
            .prices
            .iter()
            .filter(|p| p.unit_amount == Some(0))
            .collect();
        Ok(FreePriceHealth {
            zero_amount_prices: zero.len() as i64,
            active: zero.iter().filter(|p| p.active).count() as i64,
        })
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.webhook_events.contains_key(event_id) {
            return Ok(false);
        }
        inner
            .webhook_events
            .insert(event_id.to_string(), "processing".to_string());
        Ok(true)
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        _error_message: Option<String>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let result = if success { "success" } else { "error" };
        inner
            .webhook_events
            .insert(event_id.to_string(), result.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct MockInner {
    subscriptions: Vec<ProviderSubscription>,
    customers_created: usize,
    fail_next_create: Option<String>,
    fail_list: Option<String>,
    fail_preview: Option<String>,
}

/// Call-counting `BillingProvider` double.
#[derive(Default)]
pub(crate) struct MockProvider {
    inner: Mutex<MockInner>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total provider calls of any kind.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn created_customers(&self) -> usize {
        self.inner.lock().unwrap().customers_created
    }

    pub fn fail_next_create_customer(&self, message: &str) {
        self.inner.lock().unwrap().fail_next_create = Some(message.to_string());
    }

    pub fn fail_list_subscriptions(&self, message: &str) {
        self.inner.lock().unwrap().fail_list = Some(message.to_string());
    }

    pub fn fail_preview(&self, message: &str) {
        self.inner.lock().unwrap().fail_preview = Some(message.to_string());
    }

    pub fn add_subscription(&self, subscription: ProviderSubscription) {
        self.inner.lock().unwrap().subscriptions.push(subscription);
    }
}

/// Convenience builder for provider-side subscriptions.
pub(crate) fn provider_subscription(
    id: &str,
    customer_id: &str,
    status: SubscriptionStatus,
) -> ProviderSubscription {
    let now = OffsetDateTime::now_utc();
    ProviderSubscription {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        status,
        price_id: Some("price_pro_monthly".to_string()),
        current_period_start: now,
        current_period_end: now + Duration::days(30),
        cancel_at_period_end: false,
        canceled_at: if status == SubscriptionStatus::Canceled {
            Some(now)
        } else {
            None
        },
        metadata: HashMap::new(),
    }
}

#[async_trait]
impl BillingProvider for MockProvider {
    async fn create_customer(&self, _user_id: Uuid, _email: &str) -> BillingResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.fail_next_create.take() {
            return Err(BillingError::StripeApi(message));
        }
        inner.customers_created += 1;
        Ok(format!("cus_mock_{}", inner.customers_created))
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .find(|s| s.id == subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::SubscriptionMissing(subscription_id.to_string()))
    }

    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<ProviderSubscription>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.fail_list {
            return Err(BillingError::StripeApi(message.clone()));
        }
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn preview_proration(
        &self,
        customer_id: &str,
        subscription_id: &str,
        new_price_id: &str,
    ) -> BillingResult<ProrationPreview> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        if let Some(message) = &inner.fail_preview {
            return Err(BillingError::StripeApi(message.clone()));
        }
        Ok(ProrationPreview {
            customer_id: customer_id.to_string(),
            subscription_id: subscription_id.to_string(),
            new_price_id: new_price_id.to_string(),
            amount_due_cents: 1450,
            currency: "usd".to_string(),
            days_remaining: 12,
            description: "mock preview".to_string(),
        })
    }
}
