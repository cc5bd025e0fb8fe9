//! Authentication module for NAGOYAMESHI

pub mod jwt;
pub mod middleware;
pub mod password;
pub mod refresh;
pub mod sessions;

pub use jwt::{Claims, IssuedToken, JwtError, JwtManager};
pub use middleware::{require_auth, require_premium, AuthError, AuthState, AuthUser, SESSION_COOKIE};
pub use password::{hash_password, verify_password, PasswordError};
pub use refresh::{IssuedSession, SessionRefresher};
pub use sessions::{InMemorySessionStore, PgSessionStore, SessionStore};
