//! Stripe Billing Portal

use nagoyameshi_shared::User;
use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Portal service for Stripe billing portal sessions
pub struct PortalService {
    stripe: StripeClient,
}

impl PortalService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a billing portal session for the user's customer record
    pub async fn create_portal_session(&self, user: &User) -> BillingResult<BillingPortalSession> {
        let customer_id = user
            .stripe_customer_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(BillingError::NoCustomerRecord)?
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidRequest(format!("Invalid customer ID: {}", e)))?;

        let return_url = self.stripe.config().portal_return_url();

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            user_id = %user.id,
            customer_id = %session.customer,
            "Created billing portal session"
        );

        Ok(session)
    }
}
