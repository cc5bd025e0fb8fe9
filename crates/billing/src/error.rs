//! Billing error types

use stripe::StripeError;
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Network failure, provider outage, rate limit or timeout. Safe to retry.
    #[error("Billing provider unavailable: {0}")]
    GatewayUnavailable(String),

    /// The provider rejected the request as malformed
    #[error("Billing provider rejected the request: {0}")]
    InvalidRequest(String),

    /// The provider rejected our credentials
    #[error("Billing provider authentication failed: {0}")]
    AuthFailure(String),

    #[error("No billing customer record for this user")]
    NoCustomerRecord,

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// An event or redirect references a user that does not exist locally
    #[error("Unresolvable user: {0}")]
    UnresolvableUser(String),

    #[error("User already has an active subscription")]
    AlreadySubscribed,

    /// The redirect carried something that is not a checkout session id
    #[error("Invalid checkout session id: {0}")]
    InvalidCheckoutSession(String),

    #[error("Checkout session {0} is not complete")]
    CheckoutNotCompleted(String),

    #[error("Checkout session {0} belongs to another user")]
    CheckoutOwnerMismatch(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StripeError> for BillingError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::Stripe(request_error) => {
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {}", request_error.http_status));
                match request_error.http_status {
                    401 | 403 => BillingError::AuthFailure(message),
                    400 | 402 | 404 | 409 => BillingError::InvalidRequest(message),
                    _ => BillingError::GatewayUnavailable(message),
                }
            }
            StripeError::Timeout => {
                BillingError::GatewayUnavailable("request timed out".to_string())
            }
            StripeError::ClientError(message) => BillingError::GatewayUnavailable(message),
            other => BillingError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<nagoyameshi_shared::DomainError> for BillingError {
    fn from(err: nagoyameshi_shared::DomainError) -> Self {
        BillingError::Internal(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn request_error(status: u16) -> StripeError {
        let mut error = stripe::RequestError::default();
        error.http_status = status;
        error.message = Some(format!("status {}", status));
        StripeError::Stripe(error)
    }

    #[test]
    fn test_provider_status_classification() {
        assert!(matches!(
            BillingError::from(request_error(401)),
            BillingError::AuthFailure(_)
        ));
        assert!(matches!(
            BillingError::from(request_error(403)),
            BillingError::AuthFailure(_)
        ));
        assert!(matches!(
            BillingError::from(request_error(400)),
            BillingError::InvalidRequest(_)
        ));
        assert!(matches!(
            BillingError::from(request_error(404)),
            BillingError::InvalidRequest(_)
        ));
        assert!(matches!(
            BillingError::from(request_error(429)),
            BillingError::GatewayUnavailable(_)
        ));
        assert!(matches!(
            BillingError::from(request_error(503)),
            BillingError::GatewayUnavailable(_)
        ));
    }

    #[test]
    fn test_timeout_is_unavailable() {
        let err = BillingError::from(StripeError::Timeout);
        assert!(matches!(err, BillingError::GatewayUnavailable(_)));
    }
}
