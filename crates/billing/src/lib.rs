// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NAGOYAMESHI Billing Module
//!
//! Keeps each member's role in step with their Stripe subscription.
//!
//! ## Features
//!
//! - **Checkout**: Hosted subscription checkout tagged with the member's id
//! - **Redirect confirmation**: Success redirects re-verified against Stripe
//! - **Webhooks**: Signed, idempotent subscription lifecycle events
//! - **Unsubscribe**: Immediate demotion with best-effort provider cancellation
//! - **Customer portal**: Self-service billing management
//! - **Idempotency ledger**: Atomic claim of every applied event

pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod portal;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;


use std::sync::Arc;

use sqlx::PgPool;

// Checkout
pub use checkout::{CheckoutService, CheckoutSessionSummary};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{BillingGateway, StripeGateway};

// Ledger
pub use ledger::{
    IdempotencyKey, IdempotencyLedger, InMemoryIdempotencyLedger, PgIdempotencyLedger,
    ProcessedEventRecord,
};

// Portal
pub use portal::PortalService;

// Role store
pub use store::{InMemoryRoleStore, PgRoleStore, RoleStore, RoleWrite};

// Subscriptions
pub use subscriptions::{
    ProviderCancellation, SubscriptionService, SubscriptionStatus, TransitionOutcome,
    UnsubscribeOutcome,
};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookEventKind, WebhookHandler, WebhookOutcome, WebhookVerifier};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: Arc<SubscriptionService>,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_parts(
            Arc::new(PgRoleStore::new(pool.clone())),
            Arc::new(PgIdempotencyLedger::new(pool)),
            Arc::new(StripeGateway::new(StripeClient::new(config))),
        )
    }

    /// Assemble from explicit stores and gateway
    pub fn with_parts(
        store: Arc<dyn RoleStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        gateway: Arc<dyn BillingGateway>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionService::new(store, ledger, gateway));
        let webhooks = WebhookHandler::new(subscriptions.clone());
        Self {
            subscriptions,
            webhooks,
        }
    }
}
