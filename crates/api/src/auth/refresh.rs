//! Session authority refresh
//!
//! A role change made inside an interactive request is followed by
//! [`SessionRefresher::refresh`]: the caller gets a new principal and token
//! carrying the persisted role, and the token it arrived with is revoked.

use std::sync::Arc;

use nagoyameshi_shared::User;
use serde::Serialize;
use time::OffsetDateTime;

use super::jwt::JwtManager;
use super::middleware::AuthUser;
use super::sessions::{SessionStore, REASON_ROLE_CHANGED};
use crate::error::{ApiError, ApiResult};

/// A principal together with the token that carries it
#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub principal: AuthUser,
    pub access_token: String,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct SessionRefresher {
    jwt_manager: JwtManager,
    sessions: Arc<dyn SessionStore>,
}

impl SessionRefresher {
    pub fn new(jwt_manager: JwtManager, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            jwt_manager,
            sessions,
        }
    }

    pub fn token_lifetime_secs(&self) -> i64 {
        self.jwt_manager.access_token_expiry().whole_seconds()
    }

    /// Issue a new session for `user` as currently persisted
    pub async fn issue(&self, user: &User) -> ApiResult<IssuedSession> {
        let issued = self
            .jwt_manager
            .generate_access_token(user.id, user.role, &user.email)
            .map_err(|e| {
                tracing::error!(user_id = %user.id, error = %e, "Failed to sign access token");
                ApiError::Internal
            })?;

        self.sessions
            .save(user.id, &issued.jti, issued.expires_at)
            .await?;

        Ok(IssuedSession {
            principal: AuthUser {
                user_id: user.id,
                email: user.email.clone(),
                role: user.role,
                jti: issued.jti,
            },
            access_token: issued.token,
            expires_at: issued.expires_at,
        })
    }

    /// Replace `previous` with a principal built from the just-persisted `user`.
    ///
    /// The new session is stored before the old one is revoked, so the caller
    /// is never left without a valid session.
    pub async fn refresh(&self, user: &User, previous: &AuthUser) -> ApiResult<IssuedSession> {
        let session = self.issue(user).await?;

        if !self
            .sessions
            .revoke(&previous.jti, REASON_ROLE_CHANGED)
            .await?
        {
            tracing::debug!(
                user_id = %user.id,
                jti = %previous.jti,
                "Previous session was already revoked"
            );
        }

        tracing::info!(
            user_id = %user.id,
            previous_role = %previous.role,
            role = %session.principal.role,
            "Session authority refreshed"
        );

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sessions::InMemorySessionStore;
    use nagoyameshi_shared::Role;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only-32";

    fn refresher(sessions: Arc<InMemorySessionStore>) -> SessionRefresher {
        SessionRefresher::new(JwtManager::new(SECRET, 24), sessions)
    }

    #[tokio::test]
    async fn test_issue_records_session() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let refresher = refresher(sessions.clone());
        let user = User::new("hanako@example.com", "Hanako", "hash");

        let session = refresher.issue(&user).await.unwrap();

        assert_eq!(session.principal.user_id, user.id);
        assert_eq!(session.principal.role, Role::User);
        assert!(sessions
            .is_valid(&session.principal.jti, user.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_refresh_reflects_role_and_revokes_previous() {
        let sessions = Arc::new(InMemorySessionStore::new());
        let refresher = refresher(sessions.clone());
        let mut user = User::new("hanako@example.com", "Hanako", "hash");
        user.role = Role::Premium;
        let before = refresher.issue(&user).await.unwrap();

        user.role = Role::User;
        let after = refresher.refresh(&user, &before.principal).await.unwrap();

        assert_eq!(after.principal.role, Role::User);
        assert_ne!(after.principal.jti, before.principal.jti);
        assert!(!sessions
            .is_valid(&before.principal.jti, user.id)
            .await
            .unwrap());
        assert!(sessions
            .is_valid(&after.principal.jti, user.id)
            .await
            .unwrap());
        assert_eq!(
            sessions.revocation_reason(&before.principal.jti).await.as_deref(),
            Some(REASON_ROLE_CHANGED)
        );
        assert_eq!(sessions.active_sessions(user.id).await, 1);
    }
}
