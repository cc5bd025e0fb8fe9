//! Test doubles for the billing gateway
//!
//! Available to this crate's tests and, with the `test-util` feature, to other crates.

use std::collections::HashMap;

use async_trait::async_trait;
use nagoyameshi_shared::User;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::checkout::CheckoutSessionSummary;
use crate::error::{BillingError, BillingResult};
use crate::gateway::BillingGateway;
use crate::webhooks::{compute_signature, WebhookEvent, WebhookVerifier};

pub const STUB_WEBHOOK_SECRET: &str = "whsec_stub_secret";

/// In-process gateway that records calls and fakes the provider's sessions
pub struct StubGateway {
    verifier: WebhookVerifier,
    sessions: Mutex<HashMap<String, CheckoutSessionSummary>>,
    checkouts: Mutex<Vec<Uuid>>,
    cancelled_customers: Mutex<Vec<String>>,
    unavailable: Mutex<bool>,
}

impl Default for StubGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl StubGateway {
    pub fn new() -> Self {
        Self {
            verifier: WebhookVerifier::new(STUB_WEBHOOK_SECRET, 300),
            sessions: Mutex::new(HashMap::new()),
            checkouts: Mutex::new(Vec::new()),
            cancelled_customers: Mutex::new(Vec::new()),
            unavailable: Mutex::new(false),
        }
    }

    /// Make every outbound call fail with `GatewayUnavailable`
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }

    async fn check_available(&self) -> BillingResult<()> {
        if *self.unavailable.lock().await {
            return Err(BillingError::GatewayUnavailable(
                "stub provider is down".to_string(),
            ));
        }
        Ok(())
    }

    /// Register a session as the provider would report it
    pub async fn insert_session(&self, summary: CheckoutSessionSummary) {
        self.sessions.lock().await.insert(summary.id.clone(), summary);
    }

    /// Mark a session paid and complete, as after the customer finishes checkout
    pub async fn complete_session(&self, session_id: &str, customer_id: &str) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.complete = true;
            session.paid = true;
            session.customer_id = Some(customer_id.to_string());
        }
    }

    /// Users that originated a checkout, in order
    pub async fn checkouts(&self) -> Vec<Uuid> {
        self.checkouts.lock().await.clone()
    }

    pub async fn cancelled_customers(&self) -> Vec<String> {
        self.cancelled_customers.lock().await.clone()
    }

    /// A `Stripe-Signature` header for `payload`, signed now with the stub secret
    pub fn sign(&self, payload: &str) -> String {
        signature_header(STUB_WEBHOOK_SECRET, payload)
    }
}

/// Build a `Stripe-Signature` header for `payload` signed with `secret` at the current time
pub fn signature_header(secret: &str, payload: &str) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let signature = compute_signature(secret, timestamp, payload).unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

/// Body of a `checkout.session.completed` event
pub fn checkout_completed_event(
    event_id: &str,
    session_id: &str,
    user_id: Uuid,
    customer_id: &str,
) -> String {
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": "checkout.session.completed",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {
            "object": {
                "id": session_id,
                "object": "checkout.session",
                "client_reference_id": user_id.to_string(),
                "customer": customer_id,
                "subscription": "sub_stub",
                "mode": "subscription",
                "status": "complete",
                "payment_status": "paid",
                "metadata": { "userId": user_id.to_string() }
            }
        }
    })
    .to_string()
}

/// Body of a `customer.subscription.*` event
pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    status: &str,
    user_id: Option<Uuid>,
    customer_id: &str,
) -> String {
    let metadata = match user_id {
        Some(id) => serde_json::json!({ "userId": id.to_string() }),
        None => serde_json::json!({}),
    };
    serde_json::json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": {
            "object": {
                "id": "sub_stub",
                "object": "subscription",
                "customer": customer_id,
                "status": status,
                "metadata": metadata
            }
        }
    })
    .to_string()
}

#[async_trait]
impl BillingGateway for StubGateway {
    async fn create_checkout_session(&self, user: &User) -> BillingResult<String> {
        self.check_available().await?;

        let session_id = format!("cs_test_{}", Uuid::new_v4().simple());
        self.insert_session(CheckoutSessionSummary {
            id: session_id.clone(),
            user_id: Some(user.id.to_string()),
            customer_id: user.stripe_customer_id.clone(),
            complete: false,
            paid: false,
        })
        .await;
        self.checkouts.lock().await.push(user.id);

        Ok(format!("https://checkout.stripe.test/c/pay/{}", session_id))
    }

    async fn create_customer_portal_session(&self, user: &User) -> BillingResult<String> {
        self.check_available().await?;
        let customer_id = user
            .stripe_customer_id
            .as_deref()
            .ok_or(BillingError::NoCustomerRecord)?;
        Ok(format!("https://billing.stripe.test/p/session/{}", customer_id))
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary> {
        self.check_available().await?;
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::InvalidRequest(format!("No such checkout.session: {}", session_id))
            })
    }

    async fn cancel_customer_subscriptions(&self, customer_id: &str) -> BillingResult<usize> {
        self.check_available().await?;
        self.cancelled_customers
            .lock()
            .await
            .push(customer_id.to_string());
        Ok(1)
    }

    fn parse_webhook_payload(
        &self,
        raw_body: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookEvent> {
        self.verifier.parse(raw_body, signature_header)
    }
}

/// The session id embedded in a stub checkout URL
pub fn session_id_from_url(url: &str) -> Option<&str> {
    url.rsplit('/').next().filter(|id| id.starts_with("cs_"))
}
