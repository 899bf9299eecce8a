//! Server configuration loaded from the environment.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string (pooler URL).
    pub database_url: String,
    /// Optional direct URL for migrations (bypasses PgBouncer).
    pub database_direct_url: Option<String>,
    /// Address to bind the HTTP listener to.
    pub bind_address: String,
    /// HMAC secret for session JWT verification.
    pub jwt_secret: String,
    /// Session token lifetime in hours.
    pub jwt_expiry_hours: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_expiry_hours = std::env::var("JWT_EXPIRY_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24);

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
            jwt_secret,
            jwt_expiry_hours,
        })
    }
}
