//! Billing gateway: the seam between the state machine and Stripe

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use nagoyameshi_shared::User;

use crate::checkout::{CheckoutService, CheckoutSessionSummary};
use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::portal::PortalService;
use crate::webhooks::{WebhookEvent, WebhookVerifier};

/// Operations the subscription state machine needs from the billing provider.
///
/// Every call is bounded by a finite timeout and never retried internally.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Originate a hosted checkout for the premium price. Returns the redirect URL.
    async fn create_checkout_session(&self, user: &User) -> BillingResult<String>;

    /// Originate a hosted customer portal session. Returns the redirect URL.
    async fn create_customer_portal_session(&self, user: &User) -> BillingResult<String>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary>;

    /// Cancel the customer's live subscriptions, returning how many were cancelled
    async fn cancel_customer_subscriptions(&self, customer_id: &str) -> BillingResult<usize>;

    /// Verify the signature header and parse the event
    fn parse_webhook_payload(
        &self,
        raw_body: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookEvent>;
}

/// Gateway backed by the Stripe API
pub struct StripeGateway {
    checkout: CheckoutService,
    portal: PortalService,
    customer: CustomerService,
    verifier: WebhookVerifier,
    timeout: Duration,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        let config = stripe.config();
        let verifier =
            WebhookVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs);
        let timeout = config.request_timeout;

        Self {
            checkout: CheckoutService::new(stripe.clone()),
            portal: PortalService::new(stripe.clone()),
            customer: CustomerService::new(stripe),
            verifier,
            timeout,
        }
    }
}

async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.inspect_err(|e| {
            tracing::warn!(operation = %operation, error = %e, "Stripe call failed");
        }),
        Err(_) => {
            tracing::warn!(
                operation = %operation,
                timeout_secs = timeout.as_secs(),
                "Stripe call timed out"
            );
            Err(BillingError::GatewayUnavailable(format!(
                "{} timed out after {}s",
                operation,
                timeout.as_secs()
            )))
        }
    }
}

#[async_trait]
impl BillingGateway for StripeGateway {
    async fn create_checkout_session(&self, user: &User) -> BillingResult<String> {
        let session = bounded(
            self.timeout,
            "create_checkout_session",
            self.checkout.create_subscription_checkout(user),
        )
        .await?;

        session.url.ok_or_else(|| {
            BillingError::InvalidRequest(format!("Checkout session {} has no URL", session.id))
        })
    }

    async fn create_customer_portal_session(&self, user: &User) -> BillingResult<String> {
        if !user.has_customer_record() {
            return Err(BillingError::NoCustomerRecord);
        }
        let session = bounded(
            self.timeout,
            "create_customer_portal_session",
            self.portal.create_portal_session(user),
        )
        .await?;
        Ok(session.url)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary> {
        let session = bounded(
            self.timeout,
            "retrieve_checkout_session",
            self.checkout.get_session(session_id),
        )
        .await?;
        Ok(CheckoutSessionSummary::from(&session))
    }

    async fn cancel_customer_subscriptions(&self, customer_id: &str) -> BillingResult<usize> {
        bounded(
            self.timeout,
            "cancel_customer_subscriptions",
            self.customer.cancel_subscriptions(customer_id),
        )
        .await
    }

    fn parse_webhook_payload(
        &self,
        raw_body: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookEvent> {
        self.verifier.parse(raw_body, signature_header)
    }
}
