//! User session management for JWT revocation
//!
//! Sessions are tracked in the `user_sessions` table by JTI (JWT ID). A token is
//! only honoured while its session row is unrevoked and unexpired, which is what
//! lets a session refresh retire the token it replaces.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ApiResult;

pub const REASON_LOGOUT: &str = "logout";
pub const REASON_ROLE_CHANGED: &str = "role_changed";

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a newly issued token
    async fn save(&self, user_id: Uuid, jti: &str, expires_at: OffsetDateTime) -> ApiResult<()>;

    /// Whether `jti` belongs to `user_id` and is neither revoked nor expired
    async fn is_valid(&self, jti: &str, user_id: Uuid) -> ApiResult<bool>;

    /// Returns true if the session was found and revoked
    async fn revoke(&self, jti: &str, reason: &str) -> ApiResult<bool>;
}

/// Postgres-backed session store
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn save(&self, user_id: Uuid, jti: &str, expires_at: OffsetDateTime) -> ApiResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_sessions (user_id, jti, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user_id)
        .bind(jti)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_valid(&self, jti: &str, user_id: Uuid) -> ApiResult<bool> {
        let result: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT TRUE
            FROM user_sessions
            WHERE jti = $1
              AND user_id = $2
              AND revoked_at IS NULL
              AND expires_at > NOW()
            "#,
        )
        .bind(jti)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.is_some())
    }

    async fn revoke(&self, jti: &str, reason: &str) -> ApiResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE user_sessions
            SET revoked_at = NOW(),
                revocation_reason = $2
            WHERE jti = $1
              AND revoked_at IS NULL
            "#,
        )
        .bind(jti)
        .bind(reason)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    user_id: Uuid,
    expires_at: OffsetDateTime,
    revoked_at: Option<OffsetDateTime>,
    revocation_reason: Option<String>,
}

/// In-memory session store for tests and local development
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn revocation_reason(&self, jti: &str) -> Option<String> {
        self.sessions
            .lock()
            .await
            .get(jti)
            .and_then(|s| s.revocation_reason.clone())
    }

    /// Number of unrevoked, unexpired sessions for a user
    pub async fn active_sessions(&self, user_id: Uuid) -> usize {
        let now = OffsetDateTime::now_utc();
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.revoked_at.is_none() && s.expires_at > now)
            .count()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, user_id: Uuid, jti: &str, expires_at: OffsetDateTime) -> ApiResult<()> {
        self.sessions.lock().await.insert(
            jti.to_string(),
            SessionEntry {
                user_id,
                expires_at,
                revoked_at: None,
                revocation_reason: None,
            },
        );
        Ok(())
    }

    async fn is_valid(&self, jti: &str, user_id: Uuid) -> ApiResult<bool> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .sessions
            .lock()
            .await
            .get(jti)
            .is_some_and(|s| s.user_id == user_id && s.revoked_at.is_none() && s.expires_at > now))
    }

    async fn revoke(&self, jti: &str, reason: &str) -> ApiResult<bool> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(jti) {
            Some(session) if session.revoked_at.is_none() => {
                session.revoked_at = Some(OffsetDateTime::now_utc());
                session.revocation_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
