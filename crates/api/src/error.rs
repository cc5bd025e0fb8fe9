//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nagoyameshi_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is not enabled")]
    AccountDisabled,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Billing and subscription errors
    #[error(transparent)]
    Billing(#[from] BillingError),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            // Authentication
            ApiError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", self.to_string()),
            ApiError::AccountDisabled => (StatusCode::FORBIDDEN, "ACCOUNT_DISABLED", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Billing
            ApiError::Billing(err) => billing_parts(err),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

fn billing_parts(err: &BillingError) -> (StatusCode, &'static str, String) {
    match err {
        BillingError::GatewayUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "GATEWAY_UNAVAILABLE",
            "The billing provider is temporarily unavailable. Please try again.".to_string(),
        ),
        BillingError::InvalidRequest(_) | BillingError::AuthFailure(_) => (
            StatusCode::BAD_GATEWAY,
            "BILLING_PROVIDER_ERROR",
            "The billing provider rejected the request. Please try again later.".to_string(),
        ),
        BillingError::NoCustomerRecord => (
            StatusCode::CONFLICT,
            "NO_CUSTOMER_RECORD",
            "No subscription has been set up for this account yet.".to_string(),
        ),
        BillingError::AlreadySubscribed => (StatusCode::CONFLICT, "ALREADY_SUBSCRIBED", err.to_string()),
        BillingError::SignatureInvalid => (StatusCode::BAD_REQUEST, "SIGNATURE_INVALID", err.to_string()),
        BillingError::MalformedPayload(_) => (
            StatusCode::BAD_REQUEST,
            "MALFORMED_PAYLOAD",
            "Malformed webhook payload".to_string(),
        ),
        BillingError::UnresolvableUser(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "UNRESOLVABLE_USER",
            "The referenced user does not exist".to_string(),
        ),
        BillingError::InvalidCheckoutSession(_) => (
            StatusCode::BAD_REQUEST,
            "INVALID_SESSION_ID",
            "session_id is not a valid checkout session id".to_string(),
        ),
        BillingError::CheckoutNotCompleted(_) => (
            StatusCode::CONFLICT,
            "CHECKOUT_NOT_COMPLETED",
            "Checkout has not been completed yet".to_string(),
        ),
        BillingError::CheckoutOwnerMismatch(_) => (
            StatusCode::FORBIDDEN,
            "CHECKOUT_OWNER_MISMATCH",
            "Checkout session does not belong to this account".to_string(),
        ),
        BillingError::Database(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "DATABASE_ERROR",
            "Database error".to_string(),
        ),
        BillingError::Config(_) | BillingError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error".to_string(),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::Database(err.to_string())
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: BillingError) -> StatusCode {
        ApiError::from(err).status()
    }

    #[test]
    fn test_billing_error_statuses() {
        assert_eq!(
            status_of(BillingError::GatewayUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::InvalidRequest("bad".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(BillingError::AuthFailure("key".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_of(BillingError::NoCustomerRecord), StatusCode::CONFLICT);
        assert_eq!(status_of(BillingError::AlreadySubscribed), StatusCode::CONFLICT);
        assert_eq!(status_of(BillingError::SignatureInvalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(BillingError::MalformedPayload("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::UnresolvableUser("u".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(BillingError::InvalidCheckoutSession("../x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::CheckoutNotCompleted("cs".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::CheckoutOwnerMismatch("cs".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(BillingError::Database("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_provider_details_not_leaked() {
        let (_, code, message) =
            ApiError::from(BillingError::AuthFailure("sk_live_secret rejected".into())).parts();
        assert_eq!(code, "BILLING_PROVIDER_ERROR");
        assert!(!message.contains("sk_live"));
    }
}
