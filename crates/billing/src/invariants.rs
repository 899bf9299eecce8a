//! Billing invariants.
//!
//! Runnable consistency checks over the billing mirror. Safe to run after
//! any mutation or webhook replay.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected (empty for system-wide violations)
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may have wrong entitlements or double billing
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple current subscriptions violation.
#[derive(Debug, sqlx::FromRow)]
struct MultipleCurrentRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for free price singleton violation.
#[derive(Debug, sqlx::FromRow)]
struct FreePriceCountRow {
    total: i64,
    active: i64,
}

/// Row type for canceled-without-timestamp violation.
#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    sub_id: Uuid,
    user_id: Uuid,
}

/// Row type for paid subscription missing a customer mapping.
#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    user_id: Uuid,
    stripe_subscription_id: Option<String>,
}

/// Service for running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_current_subscription().await?);
        violations.extend(self.check_free_price_singleton().await?);
        violations.extend(self.check_canceled_has_timestamp().await?);
        violations.extend(self.check_paid_has_customer_mapping().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 current (active/trialing) subscription per
    /// user. More than one means double billing or entitlement confusion.
    async fn check_single_current_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleCurrentRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_current_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} current subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Among zero-amount price mirrors, exactly one is active.
    /// The free-plan repair restores this when provider-side price rotation
    /// breaks it.
    async fn check_free_price_singleton(&self) -> BillingResult<Vec<InvariantViolation>> {
        let row: FreePriceCountRow = sqlx::query_as(
            r#"
            SELECT COUNT(*) as total, COUNT(*) FILTER (WHERE active) as active
            FROM prices
            WHERE unit_amount = 0
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        if row.total == 0 || row.active == 1 {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "free_price_singleton".to_string(),
            user_ids: vec![],
            description: format!(
                "{} of {} zero-amount prices are active (expected exactly 1)",
                row.active, row.total
            ),
            context: serde_json::json!({
                "zero_amount_prices": row.total,
                "active": row.active,
            }),
            severity: ViolationSeverity::High,
        }])
    }

    /// Invariant 3: Canceled subscriptions record when they were canceled,
    /// so access revocation can be audited.
    async fn check_canceled_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, user_id
            FROM subscriptions
            WHERE status = 'canceled'
              AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_timestamp".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled subscription has no canceled_at timestamp".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: Paid subscription rows belong to users with a customer
    /// mapping; a paid row without one cannot be reconciled.
    async fn check_paid_has_customer_mapping(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT s.user_id, s.stripe_subscription_id
            FROM subscriptions s
            WHERE s.stripe_subscription_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM billing_customers c
                  WHERE c.user_id = s.user_id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_customer_mapping".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Paid subscription '{}' has no customer mapping",
                    row.stripe_subscription_id.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_current_subscription" => self.check_single_current_subscription().await,
            "free_price_singleton" => self.check_free_price_singleton().await,
            "canceled_has_timestamp" => self.check_canceled_has_timestamp().await,
            "paid_has_customer_mapping" => self.check_paid_has_customer_mapping().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_current_subscription",
            "free_price_singleton",
            "canceled_has_timestamp",
            "paid_has_customer_mapping",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"single_current_subscription"));
        assert!(checks.contains(&"free_price_singleton"));
    }
}
