//! Provider-side subscription records of a customer

use stripe::{CancelSubscription, CustomerId, ListSubscriptions, Subscription};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

pub struct CustomerService {
    stripe: StripeClient,
}

impl CustomerService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Cancel every live subscription of a customer immediately.
    /// Returns the number cancelled.
    pub async fn cancel_subscriptions(&self, customer_id: &str) -> BillingResult<usize> {
        let customer = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidRequest(format!("Invalid customer ID: {}", e)))?;

        let params = ListSubscriptions {
            customer: Some(customer),
            ..Default::default()
        };
        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;

        let mut cancelled = 0;
        for subscription in subscriptions.data {
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            Subscription::cancel(self.stripe.inner(), &subscription.id, params).await?;
            cancelled += 1;

            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %subscription.id,
                "Cancelled subscription"
            );
        }

        Ok(cancelled)
    }
}
