// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! TurfQuote API Library
//!
//! HTTP surface for the billing reconciliation subsystem: admin repair
//! endpoints, the user-facing debug resync, the plan-change preview, and
//! Stripe webhook ingestion.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
