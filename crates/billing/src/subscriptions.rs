//! Subscription state machine
//!
//! Every role change, whether from the success redirect, a webhook or an
//! explicit unsubscribe, goes through [`SubscriptionService::apply_transition`].
//! The redirect and the webhook for one checkout share the
//! `checkout_session:<id>` idempotency key, so whichever arrives second is a
//! no-op.

use std::sync::Arc;

use nagoyameshi_shared::{Role, RoleChange, SubscriptionState, Trigger, User};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::BillingGateway;
use crate::ledger::{IdempotencyKey, IdempotencyLedger};
use crate::store::{RoleStore, RoleWrite};

/// Attempts at a compare-and-set role write before giving up
const MAX_ROLE_WRITE_ATTEMPTS: usize = 3;

/// Result of applying a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { change: RoleChange, user: User },
    /// The user was already in the target state
    Unchanged { user: User },
    /// One of the idempotency keys was already claimed
    AlreadyProcessed { user: User },
}

impl TransitionOutcome {
    pub fn user(&self) -> &User {
        match self {
            TransitionOutcome::Applied { user, .. }
            | TransitionOutcome::Unchanged { user }
            | TransitionOutcome::AlreadyProcessed { user } => user,
        }
    }

    pub fn into_user(self) -> User {
        match self {
            TransitionOutcome::Applied { user, .. }
            | TransitionOutcome::Unchanged { user }
            | TransitionOutcome::AlreadyProcessed { user } => user,
        }
    }

    pub fn change(&self) -> Option<RoleChange> {
        match self {
            TransitionOutcome::Applied { change, .. } => Some(*change),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionOutcome::Applied { .. } => "applied",
            TransitionOutcome::Unchanged { .. } => "unchanged",
            TransitionOutcome::AlreadyProcessed { .. } => "already_processed",
        }
    }
}

/// What happened to the provider subscription after a local unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderCancellation {
    Cancelled { subscriptions: usize },
    /// No customer record, nothing to cancel
    Skipped,
    /// The local demotion stands; the provider will be reconciled by webhook or support
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct UnsubscribeOutcome {
    pub transition: TransitionOutcome,
    pub provider_cancellation: ProviderCancellation,
}

/// Persisted subscription status of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub user_id: Uuid,
    pub state: SubscriptionState,
    pub role: Role,
    pub has_customer_record: bool,
}

impl From<&User> for SubscriptionStatus {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            state: user.subscription_state(),
            role: user.role,
            has_customer_record: user.has_customer_record(),
        }
    }
}

/// Subscription service: checkout origination, redirect confirmation,
/// unsubscribe, portal access, and the shared transition function
pub struct SubscriptionService {
    store: Arc<dyn RoleStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    gateway: Arc<dyn BillingGateway>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn RoleStore>,
        ledger: Arc<dyn IdempotencyLedger>,
        gateway: Arc<dyn BillingGateway>,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
        }
    }

    pub fn store(&self) -> &Arc<dyn RoleStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn IdempotencyLedger> {
        &self.ledger
    }

    pub fn gateway(&self) -> &Arc<dyn BillingGateway> {
        &self.gateway
    }

    async fn load_user(&self, user_id: Uuid) -> BillingResult<User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UnresolvableUser(user_id.to_string()))
    }

    pub async fn status(&self, user_id: Uuid) -> BillingResult<SubscriptionStatus> {
        let user = self.load_user(user_id).await?;
        Ok(SubscriptionStatus::from(&user))
    }

    /// Originate a hosted checkout for an unsubscribed user
    pub async fn start_checkout(&self, user_id: Uuid) -> BillingResult<String> {
        let user = self.load_user(user_id).await?;
        if user.subscription_state() == SubscriptionState::Active {
            return Err(BillingError::AlreadySubscribed);
        }

        let url = self.gateway.create_checkout_session(&user).await?;
        tracing::info!(user_id = %user.id, "Checkout originated, awaiting confirmation");
        Ok(url)
    }

    /// Handle the success redirect for `user_id`.
    ///
    /// The session id from the query string is not trusted: the session is
    /// read back from the provider and must belong to this user and be settled.
    pub async fn confirm_checkout_redirect(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> BillingResult<TransitionOutcome> {
        if !is_checkout_session_id(session_id) {
            return Err(BillingError::InvalidCheckoutSession(session_id.to_string()));
        }

        let summary = self.gateway.retrieve_checkout_session(session_id).await?;

        let owner = summary.user_id.as_deref().map(str::trim);
        if owner != Some(user_id.to_string().as_str()) {
            tracing::warn!(
                user_id = %user_id,
                session_id = %session_id,
                session_owner = ?summary.user_id,
                "Checkout redirect for a session owned by someone else"
            );
            return Err(BillingError::CheckoutOwnerMismatch(summary.id));
        }

        if !summary.is_settled() {
            tracing::info!(
                user_id = %user_id,
                session_id = %session_id,
                complete = summary.complete,
                paid = summary.paid,
                "Checkout redirect before the session settled"
            );
            return Err(BillingError::CheckoutNotCompleted(summary.id));
        }

        let user = self.load_user(user_id).await?;
        self.apply_transition(
            user,
            Trigger::Activate,
            &[IdempotencyKey::checkout_session(&summary.id)],
            summary.customer_id.as_deref(),
        )
        .await
    }

    /// Demote the user, then cancel the provider subscription best-effort
    pub async fn unsubscribe(&self, user_id: Uuid) -> BillingResult<UnsubscribeOutcome> {
        let user = self.load_user(user_id).await?;
        let transition = self
            .apply_transition(user, Trigger::Deactivate, &[], None)
            .await?;

        let provider_cancellation = match transition.user().stripe_customer_id.as_deref() {
            Some(customer_id) if !customer_id.is_empty() => {
                match self.gateway.cancel_customer_subscriptions(customer_id).await {
                    Ok(subscriptions) => ProviderCancellation::Cancelled { subscriptions },
                    Err(e) => {
                        tracing::warn!(
                            user_id = %user_id,
                            error = %e,
                            "Provider cancellation failed after local demotion"
                        );
                        ProviderCancellation::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            _ => ProviderCancellation::Skipped,
        };

        Ok(UnsubscribeOutcome {
            transition,
            provider_cancellation,
        })
    }

    pub async fn open_customer_portal(&self, user_id: Uuid) -> BillingResult<String> {
        let user = self.load_user(user_id).await?;
        if !user.has_customer_record() {
            return Err(BillingError::NoCustomerRecord);
        }
        self.gateway.create_customer_portal_session(&user).await
    }

    /// The single transition function behind every trigger.
    ///
    /// `keys` are claimed all-or-nothing after the user has been resolved. If
    /// any is already claimed the call is a no-op. If the write fails after
    /// claiming, the keys are released so a provider retry can apply it.
    pub async fn apply_transition(
        &self,
        user: User,
        trigger: Trigger,
        keys: &[IdempotencyKey],
        customer_id: Option<&str>,
    ) -> BillingResult<TransitionOutcome> {
        let mut claimed: Vec<&str> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.ledger.try_claim(key).await {
                Ok(true) => claimed.push(&key.key),
                Ok(false) => {
                    self.release(&claimed).await;
                    tracing::info!(
                        user_id = %user.id,
                        idempotency_key = %key.key,
                        "Duplicate trigger, already processed"
                    );
                    // Whoever claimed the key may have written since `user` was read
                    let user = self.store.find_user(user.id).await?.unwrap_or(user);
                    return Ok(TransitionOutcome::AlreadyProcessed { user });
                }
                Err(e) => {
                    self.release(&claimed).await;
                    return Err(e);
                }
            }
        }

        match self.write_transition(user, trigger, customer_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    trigger = ?trigger,
                    error = %e,
                    "Failed to apply transition, releasing idempotency keys"
                );
                self.release(&claimed).await;
                Err(e)
            }
        }
    }

    async fn release(&self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.ledger.release(key).await {
                tracing::error!(
                    idempotency_key = %key,
                    error = %e,
                    "Failed to release idempotency key; a retry of this event will be skipped"
                );
            }
        }
    }

    async fn write_transition(
        &self,
        mut user: User,
        trigger: Trigger,
        customer_id: Option<&str>,
    ) -> BillingResult<TransitionOutcome> {
        if let Some(customer_id) = customer_id.filter(|id| !id.is_empty()) {
            if user.stripe_customer_id.as_deref() != Some(customer_id) {
                user = self
                    .store
                    .set_customer_id(user.id, customer_id)
                    .await?
                    .ok_or_else(|| BillingError::UnresolvableUser(user.id.to_string()))?;
                tracing::info!(
                    user_id = %user.id,
                    customer_id = %customer_id,
                    "Stored billing customer id"
                );
            }
        }

        for _ in 0..MAX_ROLE_WRITE_ATTEMPTS {
            let Some(change) = user.subscription_state().transition(trigger) else {
                tracing::info!(
                    user_id = %user.id,
                    role = %user.role,
                    trigger = ?trigger,
                    "Role already at target, nothing to write"
                );
                return Ok(TransitionOutcome::Unchanged { user });
            };

            match self
                .store
                .compare_and_set_role(user.id, change.from_role(), change.to_role())
                .await?
            {
                RoleWrite::Applied(updated) => {
                    tracing::info!(
                        user_id = %updated.id,
                        change = ?change,
                        role = %updated.role,
                        version = updated.version,
                        "Role transition applied"
                    );
                    return Ok(TransitionOutcome::Applied {
                        change,
                        user: updated,
                    });
                }
                RoleWrite::Conflict(current) => {
                    tracing::debug!(
                        user_id = %current.id,
                        role = %current.role,
                        "Role changed concurrently, re-evaluating"
                    );
                    user = current;
                }
                RoleWrite::Missing => {
                    return Err(BillingError::UnresolvableUser(user.id.to_string()));
                }
            }
        }

        Err(BillingError::Internal(format!(
            "role of user {} kept changing concurrently",
            user.id
        )))
    }
}

/// Shape of a provider checkout session id, e.g. `cs_test_a1B2`
fn is_checkout_session_id(session_id: &str) -> bool {
    session_id
        .strip_prefix("cs_")
        .is_some_and(|rest| {
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
