//! Application state

use std::sync::Arc;

use nagoyameshi_billing::{BillingResult, BillingService, RoleStore};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager, PgSessionStore, SessionRefresher, SessionStore},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Absent when the state is assembled from in-memory stores
    pub pool: Option<PgPool>,
    pub billing: Arc<BillingService>,
    pub users: Arc<dyn RoleStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub jwt_manager: JwtManager,
    pub refresher: SessionRefresher,
    /// Mark session cookies `Secure` (public URL is https)
    pub secure_cookies: bool,
}

impl AppState {
    /// Create application state backed by Postgres and Stripe
    pub fn new(pool: PgPool, config: &Config) -> BillingResult<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        let sessions: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        let mut state = Self::from_parts(
            billing,
            sessions,
            jwt_manager,
            config.public_url.starts_with("https://"),
        );
        state.pool = Some(pool);
        Ok(state)
    }

    /// Assemble state from an existing billing service and session store
    pub fn from_parts(
        billing: BillingService,
        sessions: Arc<dyn SessionStore>,
        jwt_manager: JwtManager,
        secure_cookies: bool,
    ) -> Self {
        let users = billing.subscriptions.store().clone();
        let refresher = SessionRefresher::new(jwt_manager.clone(), sessions.clone());

        Self {
            pool: None,
            billing: Arc::new(billing),
            users,
            sessions,
            jwt_manager,
            refresher,
            secure_cookies,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            sessions: self.sessions.clone(),
            users: self.users.clone(),
        }
    }
}
