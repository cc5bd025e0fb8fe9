//! Role store: persisted users, their role and billing customer id

use std::collections::HashMap;

use async_trait::async_trait;
use nagoyameshi_shared::{Role, User};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of a compare-and-set role write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleWrite {
    /// The role matched and was replaced
    Applied(User),
    /// Someone else changed the role first; carries the current row
    Conflict(User),
    Missing,
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn find_user(&self, id: Uuid) -> BillingResult<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>>;

    async fn find_user_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<User>>;

    /// Replace the role only if it is still `expected`, bumping `version`
    async fn compare_and_set_role(
        &self,
        id: Uuid,
        expected: Role,
        new_role: Role,
    ) -> BillingResult<RoleWrite>;

    async fn set_customer_id(&self, id: Uuid, customer_id: &str) -> BillingResult<Option<User>>;
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    name: String,
    password_hash: String,
    enabled: bool,
    role: String,
    stripe_customer_id: Option<String>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<UserRow> for User {
    type Error = BillingError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            enabled: row.enabled,
            role: row.role.parse()?,
            stripe_customer_id: row.stripe_customer_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const USER_COLUMNS: &str = "id, email, name, password_hash, enabled, role, stripe_customer_id, version, created_at, updated_at";

/// Role store backed by the `users` table
#[derive(Clone)]
pub struct PgRoleStore {
    pool: PgPool,
}

impl PgRoleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_by(&self, predicate: &str, value: &str) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE {} = $1", USER_COLUMNS, predicate);
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }
}

#[async_trait]
impl RoleStore for PgRoleStore {
    async fn find_user(&self, id: Uuid) -> BillingResult<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        self.fetch_one_by("LOWER(email)", &email.trim().to_lowercase())
            .await
    }

    async fn find_user_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<User>> {
        self.fetch_one_by("stripe_customer_id", customer_id).await
    }

    async fn compare_and_set_role(
        &self,
        id: Uuid,
        expected: Role,
        new_role: Role,
    ) -> BillingResult<RoleWrite> {
        let sql = format!(
            r#"
            UPDATE users
            SET role = $3, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND role = $2
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let updated = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(new_role.as_str())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = updated {
            return Ok(RoleWrite::Applied(User::try_from(row)?));
        }

        Ok(match self.find_user(id).await? {
            Some(current) => RoleWrite::Conflict(current),
            None => RoleWrite::Missing,
        })
    }

    async fn set_customer_id(&self, id: Uuid, customer_id: &str) -> BillingResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }
}

/// In-memory role store for tests and local development
#[derive(Default)]
pub struct InMemoryRoleStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.users.lock().await.insert(user.id, user);
    }

    pub async fn snapshot(&self) -> Vec<User> {
        self.users.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn find_user(&self, id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> BillingResult<Option<User>> {
        let email = email.trim().to_lowercase();
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|user| user.email.to_lowercase() == email)
            .cloned())
    }

    async fn find_user_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<User>> {
        Ok(self
            .users
            .lock()
            .await
            .values()
            .find(|user| user.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn compare_and_set_role(
        &self,
        id: Uuid,
        expected: Role,
        new_role: Role,
    ) -> BillingResult<RoleWrite> {
        let mut users = self.users.lock().await;
        let Some(user) = users.get_mut(&id) else {
            return Ok(RoleWrite::Missing);
        };
        if user.role != expected {
            return Ok(RoleWrite::Conflict(user.clone()));
        }
        user.role = new_role;
        user.version += 1;
        user.updated_at = OffsetDateTime::now_utc();
        Ok(RoleWrite::Applied(user.clone()))
    }

    async fn set_customer_id(&self, id: Uuid, customer_id: &str) -> BillingResult<Option<User>> {
        let mut users = self.users.lock().await;
        if users
            .values()
            .any(|other| other.id != id && other.stripe_customer_id.as_deref() == Some(customer_id))
        {
            return Err(BillingError::Database(format!(
                "customer {} already belongs to another user",
                customer_id
            )));
        }
        Ok(users.get_mut(&id).map(|user| {
            user.stripe_customer_id = Some(customer_id.to_string());
            user.updated_at = OffsetDateTime::now_utc();
            user.clone()
        }))
    }
}
