//! API error type and JSON error envelope.
//!
//! Every failure leaves the server as a non-2xx status with a
//! `{"error", "message"}` body; no endpoint returns HTTP success carrying a
//! failure payload.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use turfquote_billing::BillingError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("billing provider error: {0}")]
    Provider(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::Validation(_) => "validation",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Provider(_) => "provider_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::SubscriptionMissing(id) => {
                ApiError::NotFound(format!("subscription {} not found at provider", id))
            }
            BillingError::CustomerNotFound(id) => {
                ApiError::NotFound(format!("no billing customer mapping for {}", id))
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::ProviderStateConflict { .. } => ApiError::Conflict(e.to_string()),
            BillingError::StripeApi(msg) => ApiError::Provider(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::Validation("webhook signature verification failed".to_string())
            }
            BillingError::Database(msg) => ApiError::Internal(format!("database error: {}", msg)),
            BillingError::Config(msg) => ApiError::Internal(format!("configuration: {}", msg)),
            BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Provider("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_billing_error_conversion() {
        let err: ApiError = BillingError::SubscriptionMissing("sub_1".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = BillingError::ProviderStateConflict {
            customer_id: "cus_1".into(),
            count: 2,
        }
        .into();
        assert!(matches!(err, ApiError::Conflict(_)));

        let err: ApiError = BillingError::Database("write failed".into()).into();
        assert!(matches!(err, ApiError::Internal(_)));

        let err: ApiError = BillingError::StripeApi("rate limited".into()).into();
        assert!(matches!(err, ApiError::Provider(ref m) if m == "rate limited"));
    }
}
