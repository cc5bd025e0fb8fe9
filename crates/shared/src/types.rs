//! Domain types shared across NAGOYAMESHI crates

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DomainError;

/// Coarse-grained authorization level attached to a user.
///
/// Persisted as `ROLE_USER` / `ROLE_PREMIUM`; the bare names `USER` / `PREMIUM`
/// are accepted when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    Premium,
}

impl Role {
    /// Name as stored in the `users.role` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "ROLE_USER",
            Role::Premium => "ROLE_PREMIUM",
        }
    }

    pub fn is_premium(&self) -> bool {
        matches!(self, Role::Premium)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ROLE_USER" | "USER" => Ok(Role::User),
            "ROLE_PREMIUM" | "PREMIUM" => Ok(Role::Premium),
            other => Err(DomainError::UnknownRole(other.to_string())),
        }
    }
}

/// A registered member.
///
/// `role` is never null; it is only mutated through the subscription state
/// machine in `nagoyameshi-billing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub enabled: bool,
    pub role: Role,
    /// Billing provider customer identifier, set once a checkout completes
    pub stripe_customer_id: Option<String>,
    /// Bumped on every role write
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    /// A freshly signed-up member: disabled until email verification, role USER
    pub fn new(email: impl Into<String>, name: impl Into<String>, password_hash: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name: name.into(),
            password_hash: password_hash.into(),
            enabled: false,
            role: Role::User,
            stripe_customer_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_customer_record(&self) -> bool {
        self.stripe_customer_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

/// Subscription state of a user, derived from the persisted role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Unsubscribed,
    Active,
}

/// What a checkout redirect, webhook or unsubscribe action asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Activate,
    Deactivate,
}

/// A legal role write. There is no variant for writing the role a user already has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleChange {
    Promote,
    Demote,
}

impl SubscriptionState {
    pub fn of(role: Role) -> Self {
        match role {
            Role::User => SubscriptionState::Unsubscribed,
            Role::Premium => SubscriptionState::Active,
        }
    }

    /// The role write `trigger` requires from this state, if any
    pub fn transition(self, trigger: Trigger) -> Option<RoleChange> {
        match (self, trigger) {
            (SubscriptionState::Unsubscribed, Trigger::Activate) => Some(RoleChange::Promote),
            (SubscriptionState::Active, Trigger::Deactivate) => Some(RoleChange::Demote),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Unsubscribed => "unsubscribed",
            SubscriptionState::Active => "active",
        }
    }
}

impl RoleChange {
    pub fn from_role(&self) -> Role {
        match self {
            RoleChange::Promote => Role::User,
            RoleChange::Demote => Role::Premium,
        }
    }

    pub fn to_role(&self) -> Role {
        match self {
            RoleChange::Promote => Role::Premium,
            RoleChange::Demote => Role::User,
        }
    }
}

impl User {
    pub fn subscription_state(&self) -> SubscriptionState {
        SubscriptionState::of(self.role)
    }
}

/// Parse a user id carried in provider metadata or a token subject
pub fn parse_user_id(raw: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(raw.trim()).map_err(|_| DomainError::InvalidUserId(raw.to_string()))
}
