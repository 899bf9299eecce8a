//! Application state.

use std::sync::Arc;

use sqlx::PgPool;
use turfquote_billing::{BillingService, StripeConfig};

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    /// Build the state with an explicit Stripe configuration.
    ///
    /// Dependencies are passed in rather than read ambiently so tests can
    /// construct a state without touching the process environment.
    pub fn new(pool: PgPool, config: Config, stripe_config: StripeConfig) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let billing = Arc::new(BillingService::new(stripe_config, pool.clone()));

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }
}
