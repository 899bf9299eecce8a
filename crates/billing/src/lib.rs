// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! TurfQuote Billing Module
//!
//! Keeps the local subscription mirror consistent with Stripe, the
//! authoritative billing provider.
//!
//! ## Features
//!
//! - **Customer Resolution**: Lazy mapping of users to Stripe customers
//! - **Subscription Upsert**: Idempotent mirroring of provider state
//! - **Free-Plan Guarantees**: One active zero-amount price, one free grant
//! - **Reconciliation**: Detect and repair provider/mirror drift
//! - **Plan-Change Preview**: Proration previews without mutating state
//! - **Webhooks**: Handle Stripe events with idempotent processing
//! - **Invariants**: Runnable consistency checks over the mirror

pub mod client;
pub mod customer;
pub mod error;
pub mod free_plan;
pub mod invariants;
pub mod preview;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod test_support;

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Free plan
pub use free_plan::{FreePlanService, PLAN_TYPE_FREE, PLAN_TYPE_KEY};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Preview
pub use preview::PlanChangePreviewService;

// Provider
pub use provider::{
    BillingProvider, ProrationPreview, ProviderPrice, ProviderSubscription, StripeProvider,
};

// Reconcile
pub use reconcile::{ReconcileOutcome, ReconciliationService};

// Store
pub use store::{
    FreePriceHealth, FreeSubscriptionWrite, PgSubscriptionStore, SubscriptionRecord,
    SubscriptionStore, SubscriptionWrite,
};

// Sync
pub use sync::SubscriptionSyncService;

// Webhooks
pub use webhooks::WebhookHandler;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub customers: CustomerService,
    pub sync: SubscriptionSyncService,
    pub free_plan: FreePlanService,
    pub reconcile: ReconciliationService,
    pub preview: PlanChangePreviewService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let provider: Arc<dyn BillingProvider> = Arc::new(StripeProvider::new(stripe.clone()));

        let customers = CustomerService::new(store.clone(), provider.clone());
        let sync = SubscriptionSyncService::new(store.clone(), provider.clone());
        let reconcile = ReconciliationService::new(
            store.clone(),
            provider.clone(),
            customers.clone(),
            sync.clone(),
        );
        let free_plan = FreePlanService::new(store.clone());
        let preview = PlanChangePreviewService::new(provider);
        let webhooks = WebhookHandler::new(stripe, store, sync.clone());
        let invariants = InvariantChecker::new(pool);

        Self {
            customers,
            sync,
            free_plan,
            reconcile,
            preview,
            webhooks,
            invariants,
        }
    }
}
