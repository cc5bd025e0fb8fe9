//! Stripe client configuration

use std::time::Duration;

use stripe::Client;

use crate::error::{BillingError, BillingResult};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price of the premium subscription
    pub price_id: String,
    /// Base URL for success/cancel/portal redirects
    pub app_base_url: String,
    /// Upper bound on every outbound Stripe call
    pub request_timeout: Duration,
    /// Maximum age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let request_timeout_secs = match std::env::var("STRIPE_REQUEST_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::Config(format!("STRIPE_REQUEST_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_REQUEST_TIMEOUT_SECS,
        };
        if request_timeout_secs == 0 {
            return Err(BillingError::Config(
                "STRIPE_REQUEST_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse::<i64>().map_err(|_| {
                BillingError::Config(format!(
                    "STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {}",
                    raw
                ))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            price_id: required("STRIPE_SUBSCRIPTION_PRICE_ID")?,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout: Duration::from_secs(request_timeout_secs),
            webhook_tolerance_secs,
        })
    }

    /// Where the provider sends the browser after a paid checkout.
    /// `{CHECKOUT_SESSION_ID}` is substituted by Stripe.
    pub fn success_url(&self) -> String {
        format!(
            "{}/api/v1/subscription/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/api/v1/subscription/cancel", self.app_base_url)
    }

    pub fn portal_return_url(&self) -> String {
        format!("{}/api/v1/subscription", self.app_base_url)
    }
}

fn required(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} not set", name))),
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "STRIPE_SECRET_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "STRIPE_SUBSCRIPTION_PRICE_ID",
        "APP_BASE_URL",
        "STRIPE_REQUEST_TIMEOUT_SECS",
        "STRIPE_WEBHOOK_TOLERANCE_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn set_required() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_abc");
        std::env::set_var("STRIPE_SUBSCRIPTION_PRICE_ID", "price_premium");
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        set_required();

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.price_id, "price_premium");
        assert_eq!(config.app_base_url, "http://localhost:8080");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.webhook_tolerance_secs, 300);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_price_is_config_error() {
        clear_env();
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_abc");

        let err = StripeConfig::from_env().unwrap_err();
        assert!(matches!(err, BillingError::Config(msg) if msg.contains("STRIPE_SUBSCRIPTION_PRICE_ID")));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_timeout_rejected() {
        clear_env();
        set_required();
        std::env::set_var("STRIPE_REQUEST_TIMEOUT_SECS", "0");

        assert!(matches!(
            StripeConfig::from_env(),
            Err(BillingError::Config(_))
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_redirect_urls() {
        clear_env();
        set_required();
        std::env::set_var("APP_BASE_URL", "https://nagoyameshi.example/");

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(
            config.success_url(),
            "https://nagoyameshi.example/api/v1/subscription/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            config.cancel_url(),
            "https://nagoyameshi.example/api/v1/subscription/cancel"
        );
        assert_eq!(
            config.portal_return_url(),
            "https://nagoyameshi.example/api/v1/subscription"
        );

        clear_env();
    }
}
