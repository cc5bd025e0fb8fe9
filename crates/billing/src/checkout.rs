//! Stripe Checkout sessions for the premium subscription

use std::collections::HashMap;

use nagoyameshi_shared::User;
use stripe::{
    CheckoutSession, CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus,
    CheckoutSessionStatus, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CustomerId,
};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::webhooks::USER_ID_METADATA_KEY;

/// What the redirect handler needs to know about a checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionSummary {
    pub id: String,
    /// User id from the session metadata (or `client_reference_id`)
    pub user_id: Option<String>,
    pub customer_id: Option<String>,
    pub complete: bool,
    /// Paid, or no payment was required
    pub paid: bool,
}

impl CheckoutSessionSummary {
    /// Whether the provider considers the subscription purchase finished
    pub fn is_settled(&self) -> bool {
        self.complete && self.paid
    }
}

impl From<&CheckoutSession> for CheckoutSessionSummary {
    fn from(session: &CheckoutSession) -> Self {
        let user_id = session
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get(USER_ID_METADATA_KEY).cloned())
            .or_else(|| session.client_reference_id.clone());

        Self {
            id: session.id.to_string(),
            user_id,
            customer_id: session.customer.as_ref().map(|customer| customer.id().to_string()),
            complete: matches!(session.status, Some(CheckoutSessionStatus::Complete)),
            paid: matches!(
                session.payment_status,
                CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired
            ),
        }
    }
}

/// Checkout service for subscription purchases
pub struct CheckoutService {
    stripe: StripeClient,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a subscription-mode checkout session tagged with the user's id
    pub async fn create_subscription_checkout(&self, user: &User) -> BillingResult<CheckoutSession> {
        let config = self.stripe.config();
        let success_url = config.success_url();
        let cancel_url = config.cancel_url();
        let user_id = user.id.to_string();

        let customer = match user.stripe_customer_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(id.parse::<CustomerId>().map_err(|e| {
                BillingError::InvalidRequest(format!("Invalid customer ID: {}", e))
            })?),
            None => None,
        };

        let mut metadata = HashMap::new();
        metadata.insert(USER_ID_METADATA_KEY.to_string(), user_id.clone());

        let params = CreateCheckoutSession {
            // Stripe rejects customer and customer_email together
            customer_email: if customer.is_none() {
                Some(&user.email)
            } else {
                None
            },
            customer,
            client_reference_id: Some(&user_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(config.price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata.clone()),
                ..Default::default()
            }),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(session)
    }

    /// Retrieve a checkout session by ID
    pub async fn get_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let session_id = session_id
            .parse::<CheckoutSessionId>()
            .map_err(|_| BillingError::InvalidCheckoutSession(session_id.to_string()))?;

        let session = CheckoutSession::retrieve(self.stripe.inner(), &session_id, &[]).await?;
        Ok(session)
    }
}
