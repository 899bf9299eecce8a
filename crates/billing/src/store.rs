//! Local billing store.
//!
//! `SubscriptionStore` is the persistence seam for the reconciliation
//! subsystem: the customer mapping, the subscription mirror, the price
//! mirror, and the webhook idempotency ledger. Production uses
//! [`PgSubscriptionStore`]; tests run against an in-memory double.
//!
//! Write failures are returned to callers, never logged-and-swallowed: a
//! caller must not believe state was persisted when it was not.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use turfquote_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::ProviderPrice;

/// How long a webhook event may sit in `processing` before another delivery
/// is allowed to re-claim it.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// A locally mirrored subscription row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// None for free-plan rows.
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub stripe_price_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Free-plan rows carry no provider identifiers.
    pub fn is_free_plan(&self) -> bool {
        self.stripe_subscription_id.is_none()
    }
}

/// Fields written when mirroring a provider subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub user_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub status: SubscriptionStatus,
    pub stripe_price_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: serde_json::Value,
}

/// Fields written when granting a free-plan subscription.
#[derive(Debug, Clone)]
pub struct FreeSubscriptionWrite {
    pub user_id: Uuid,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub metadata: serde_json::Value,
}

/// Counts backing the free-price health report.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FreePriceHealth {
    pub zero_amount_prices: i64,
    pub active: i64,
}

impl FreePriceHealth {
    /// Healthy when there is nothing to repair: either no zero-amount
    /// mirrors exist yet, or exactly one is active.
    pub fn is_healthy(&self) -> bool {
        self.zero_amount_prices == 0 || self.active == 1
    }
}

/// Persistence surface for the reconciliation subsystem.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Customer mapping

    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>>;

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    /// Insert the mapping if absent and return the winning customer id.
    ///
    /// Under a concurrent double-create the loser's insert is a no-op and
    /// the winner's id is returned, so callers can detect the orphaned
    /// provider customer they created.
    async fn persist_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<String>;

    // Subscription mirror

    /// Upsert keyed on the external subscription id. Idempotent: replaying
    /// identical provider state leaves exactly one row with those fields.
    async fn upsert_subscription(
        &self,
        write: SubscriptionWrite,
    ) -> BillingResult<SubscriptionRecord>;

    /// The user's current (active or trialing) subscription, if any.
    async fn current_subscription(&self, user_id: Uuid)
        -> BillingResult<Option<SubscriptionRecord>>;

    async fn subscriptions_for_user(&self, user_id: Uuid)
        -> BillingResult<Vec<SubscriptionRecord>>;

    /// Insert a free-plan grant, or return the existing current row if the
    /// user already has one. The check-and-insert is a single logical unit;
    /// two concurrent grants must converge on one row.
    async fn insert_free_subscription(
        &self,
        write: FreeSubscriptionWrite,
    ) -> BillingResult<SubscriptionRecord>;

    // Price mirror

    async fn upsert_price(&self, price: ProviderPrice) -> BillingResult<()>;

    async fn deactivate_price(&self, price_id: &str) -> BillingResult<()>;

    /// Repair the zero-amount price mirrors so exactly one is active.
    /// Returns the activated price id, or None when no repair was needed
    /// (already exactly one active, or no zero-amount mirrors exist).
    async fn activate_newest_free_price(&self) -> BillingResult<Option<String>>;

    async fn free_price_health(&self) -> BillingResult<FreePriceHealth>;

    // Webhook idempotency ledger

    /// Atomically claim exclusive processing rights for a webhook event.
    /// Returns false when another delivery already claimed or completed it.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> BillingResult<()>;
}

/// Database row type for subscription reads.
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    status: String,
    stripe_price_id: Option<String>,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Internal(e.to_string()))?;
        Ok(SubscriptionRecord {
            id: row.id,
            user_id: row.user_id,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_customer_id: row.stripe_customer_id,
            status,
            stripe_price_id: row.stripe_price_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, stripe_subscription_id, stripe_customer_id, \
     status, stripe_price_id, current_period_start, current_period_end, \
     cancel_at_period_end, canceled_at, metadata, created_at, updated_at";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM billing_customers WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM billing_customers WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn persist_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<String> {
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_customers (user_id, stripe_customer_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING stripe_customer_id
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(id);
        }

        // Lost the insert race; the winner's mapping is authoritative.
        let existing = self.customer_for_user(user_id).await?;
        existing.ok_or_else(|| {
            BillingError::Internal(format!(
                "customer mapping for user {} vanished during insert race",
                user_id
            ))
        })
    }

    async fn upsert_subscription(
        &self,
        write: SubscriptionWrite,
    ) -> BillingResult<SubscriptionRecord> {
        let mut tx = self.pool.begin().await?;

        // A paid subscription becoming current supersedes any free-plan
        // grant; closing it here keeps the single-current-row index happy.
        if write.status.is_current() {
            sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = 'canceled', canceled_at = NOW(), updated_at = NOW()
                WHERE user_id = $1
                  AND stripe_subscription_id IS NULL
                  AND status IN ('active', 'trialing')
                "#,
            )
            .bind(write.user_id)
            .execute(&mut *tx)
            .await?;
        }

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_subscription_id, stripe_customer_id, status,
                stripe_price_id, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, metadata, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW()
            )
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                status = EXCLUDED.status,
                stripe_price_id = EXCLUDED.stripe_price_id,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(write.user_id)
        .bind(&write.stripe_subscription_id)
        .bind(&write.stripe_customer_id)
        .bind(write.status.as_str())
        .bind(&write.stripe_price_id)
        .bind(write.current_period_start)
        .bind(write.current_period_end)
        .bind(write.cancel_at_period_end)
        .bind(write.canceled_at)
        .bind(&write.metadata)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn current_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn subscriptions_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_free_subscription(
        &self,
        write: FreeSubscriptionWrite,
    ) -> BillingResult<SubscriptionRecord> {
        // The partial unique index on (user_id) WHERE status IN
        // ('active','trialing') is the arbiter: the losing insert of a
        // concurrent double-grant becomes a no-op.
        let inserted: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_subscription_id, stripe_customer_id, status,
                stripe_price_id, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, metadata, created_at, updated_at
            ) VALUES (
                $1, $2, NULL, NULL, 'active', NULL, $3, $4, FALSE, NULL, $5, NOW(), NOW()
            )
            ON CONFLICT (user_id) WHERE status IN ('active', 'trialing') DO NOTHING
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(write.user_id)
        .bind(write.current_period_start)
        .bind(write.current_period_end)
        .bind(&write.metadata)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return row.try_into();
        }

        let existing = self.current_subscription(write.user_id).await?;
        existing.ok_or_else(|| {
            BillingError::Internal(format!(
                "free grant for user {} lost an insert race but no current row exists",
                write.user_id
            ))
        })
    }

    async fn upsert_price(&self, price: ProviderPrice) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO prices (
                stripe_price_id, unit_amount, currency, recurring_interval,
                active, created, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (stripe_price_id) DO UPDATE SET
                unit_amount = EXCLUDED.unit_amount,
                currency = EXCLUDED.currency,
                recurring_interval = EXCLUDED.recurring_interval,
                active = EXCLUDED.active,
                created = EXCLUDED.created,
                updated_at = NOW()
            "#,
        )
        .bind(&price.id)
        .bind(price.unit_amount)
        .bind(&price.currency)
        .bind(&price.recurring_interval)
        .bind(price.active)
        .bind(price.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_price(&self, price_id: &str) -> BillingResult<()> {
        sqlx::query("UPDATE prices SET active = FALSE, updated_at = NOW() WHERE stripe_price_id = $1")
            .bind(price_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn activate_newest_free_price(&self) -> BillingResult<Option<String>> {
        let mut tx = self.pool.begin().await?;

        // Lock the zero-amount mirrors so concurrent repairs serialize.
        let rows: Vec<(String, bool)> = sqlx::query_as(
            r#"
            SELECT stripe_price_id, active
            FROM prices
            WHERE unit_amount = 0
            ORDER BY created DESC, stripe_price_id
            FOR UPDATE
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(None);
        }

        let active_count = rows.iter().filter(|(_, active)| *active).count();
        if active_count == 1 {
            tx.commit().await?;
            return Ok(None);
        }

        // Zero or several active: collapse to the newest mirror.
        let newest = rows[0].0.clone();
        sqlx::query(
            r#"
            UPDATE prices
            SET active = (stripe_price_id = $1), updated_at = NOW()
            WHERE unit_amount = 0
              AND active IS DISTINCT FROM (stripe_price_id = $1)
            "#,
        )
        .bind(&newest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(newest))
    }

    async fn free_price_health(&self) -> BillingResult<FreePriceHealth> {
        let (zero_amount_prices, active): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(*) FILTER (WHERE active)
            FROM prices
            WHERE unit_amount = 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(FreePriceHealth {
            zero_amount_prices,
            active,
        })
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT...ON CONFLICT...RETURNING atomically claims exclusive
        // processing rights; events stuck in `processing` past the timeout
        // may be re-claimed.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - make_interval(mins => $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> BillingResult<()> {
        let processing_result = if success { "success" } else { "error" };
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
