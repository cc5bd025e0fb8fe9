//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, parses the event envelope, and feeds
//! subscription lifecycle events into the subscription state machine.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use nagoyameshi_shared::{parse_user_id, Trigger, User};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::ledger::IdempotencyKey;
use crate::subscriptions::{SubscriptionService, TransitionOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Metadata key carrying our user id on checkout sessions and subscriptions
pub const USER_ID_METADATA_KEY: &str = "userId";

/// Compute the hex-encoded `v1` signature Stripe sends for `payload` at `timestamp`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks webhook signatures against the shared signing secret
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify the signature and parse the event
    pub fn parse(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify(payload, signature)?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Signed webhook payload is not a valid event");
            BillingError::MalformedPayload(e.to_string())
        })
    }

    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<()> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify against an explicit clock
    ///
    /// Header format: `t=timestamp,v1=signature[,v1=signature...][,v0=...]`.
    /// Any matching `v1` entry is accepted; Stripe sends several while a secret
    /// is being rolled.
    pub fn verify_at(&self, payload: &str, signature: &str, now: i64) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::SignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::SignatureInvalid);
        }

        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let matched = candidates.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!(
                candidates = candidates.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::SignatureInvalid);
        }

        Ok(())
    }
}

/// Verified webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: WebhookObject,
}

/// The fields of the embedded checkout session or subscription we act on
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    /// Either a customer id or an expanded customer object
    #[serde(default)]
    pub customer: Option<serde_json::Value>,
    #[serde(default)]
    pub subscription: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
}

fn expandable_id(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Object(object) => object
            .get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string),
        _ => None,
    }
}

impl WebhookObject {
    /// The user id from metadata, falling back to `client_reference_id`
    pub fn user_id_reference(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get(USER_ID_METADATA_KEY))
            .map(String::as_str)
            .or(self.client_reference_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    pub fn customer_id(&self) -> Option<String> {
        expandable_id(self.customer.as_ref())
    }

    pub fn subscription_id(&self) -> Option<String> {
        expandable_id(self.subscription.as_ref())
    }
}

impl WebhookEvent {
    pub fn kind(&self) -> WebhookEventKind {
        WebhookEventKind::parse(&self.event_type)
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.created).ok()
    }

    pub fn object(&self) -> &WebhookObject {
        &self.data.object
    }
}

/// Event types that drive the subscription state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventKind {
    CheckoutSessionCompleted,
    CheckoutSessionAsyncPaymentSucceeded,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other,
}

impl WebhookEventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "checkout.session.async_payment_succeeded" => {
                Self::CheckoutSessionAsyncPaymentSucceeded
            }
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            _ => Self::Other,
        }
    }

    pub fn is_checkout(&self) -> bool {
        matches!(
            self,
            Self::CheckoutSessionCompleted | Self::CheckoutSessionAsyncPaymentSucceeded
        )
    }

    /// The trigger this event asks for, or `None` when it should be ignored
    pub fn trigger(&self, object: &WebhookObject) -> Option<Trigger> {
        match self {
            Self::CheckoutSessionCompleted | Self::CheckoutSessionAsyncPaymentSucceeded => {
                // Delayed payment methods complete the session unpaid;
                // async_payment_succeeded follows once funds clear.
                match object.payment_status.as_deref() {
                    None | Some("paid") | Some("no_payment_required") => Some(Trigger::Activate),
                    Some(_) => None,
                }
            }
            Self::SubscriptionCreated | Self::SubscriptionUpdated => {
                subscription_status_trigger(object.status.as_deref()?)
            }
            Self::SubscriptionDeleted => Some(Trigger::Deactivate),
            Self::Other => None,
        }
    }
}

fn subscription_status_trigger(status: &str) -> Option<Trigger> {
    match status {
        "active" | "trialing" => Some(Trigger::Activate),
        "canceled" | "unpaid" | "incomplete_expired" | "paused" => Some(Trigger::Deactivate),
        // incomplete, past_due: wait for the provider to settle
        _ => None,
    }
}

/// Result of handling one webhook delivery
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Transition(TransitionOutcome),
    Ignored { event_type: String },
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Transition(outcome) => outcome.as_str(),
            WebhookOutcome::Ignored { .. } => "ignored",
        }
    }
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    subscriptions: Arc<SubscriptionService>,
}

impl WebhookHandler {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subscriptions }
    }

    /// Verify, parse and apply a raw webhook delivery
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<WebhookOutcome> {
        let event = self
            .subscriptions
            .gateway()
            .parse_webhook_payload(payload, signature)
            .inspect_err(|e| {
                tracing::warn!(error = %e, "Rejected webhook delivery");
            })?;

        self.handle_event(event).await
    }

    /// Handle a verified Stripe event
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let kind = event.kind();

        let Some(trigger) = kind.trigger(event.object()) else {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring webhook event"
            );
            return Ok(WebhookOutcome::Ignored {
                event_type: event.event_type,
            });
        };

        let user = self.resolve_user(&event).await?;

        let mut keys = vec![IdempotencyKey::event(
            &event.id,
            &event.event_type,
            event.created_at(),
        )];
        if kind.is_checkout() {
            if let Some(session_id) = event.object().id.as_deref() {
                keys.push(IdempotencyKey::checkout_session(session_id));
            }
        }

        let customer_id = match trigger {
            Trigger::Activate => event.object().customer_id(),
            Trigger::Deactivate => None,
        };

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = %user.id,
            subscription_id = ?event.object().subscription_id(),
            trigger = ?trigger,
            "Processing Stripe webhook event"
        );

        let outcome = self
            .subscriptions
            .apply_transition(user, trigger, &keys, customer_id.as_deref())
            .await?;

        Ok(WebhookOutcome::Transition(outcome))
    }

    /// Resolve the local user an event refers to: `userId` metadata first,
    /// then the stored provider customer id.
    async fn resolve_user(&self, event: &WebhookEvent) -> BillingResult<User> {
        let object = event.object();
        let store = self.subscriptions.store();

        if let Some(raw) = object.user_id_reference() {
            let user_id = parse_user_id(raw).map_err(|_| {
                tracing::error!(
                    event_id = %event.id,
                    user_reference = %raw,
                    "Webhook references a malformed user id"
                );
                BillingError::UnresolvableUser(raw.to_string())
            })?;

            return store.find_user(user_id).await?.ok_or_else(|| {
                tracing::error!(
                    event_id = %event.id,
                    user_id = %user_id,
                    "Webhook references an unknown user"
                );
                BillingError::UnresolvableUser(user_id.to_string())
            });
        }

        if let Some(customer_id) = object.customer_id() {
            return store
                .find_user_by_customer_id(&customer_id)
                .await?
                .ok_or_else(|| {
                    tracing::error!(
                        event_id = %event.id,
                        customer_id = %customer_id,
                        "Webhook references an unknown customer"
                    );
                    BillingError::UnresolvableUser(customer_id)
                });
        }

        tracing::error!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Webhook carries no user reference"
        );
        Err(BillingError::UnresolvableUser(format!(
            "event {} has no user reference",
            event.id
        )))
    }
}
