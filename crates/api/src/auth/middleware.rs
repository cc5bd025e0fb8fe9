//! Authentication middleware for Axum

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use nagoyameshi_billing::RoleStore;
use nagoyameshi_shared::Role;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::jwt::JwtManager;
use super::sessions::SessionStore;

/// Cookie carrying the access token for browser clients
pub const SESSION_COOKIE: &str = "nagoyameshi_session";

/// Authenticated principal for the current request
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    /// Role as persisted when the request was authenticated
    pub role: Role,
    /// JWT ID of the session the request arrived with
    #[serde(skip)]
    pub jti: String,
}

impl AuthUser {
    pub fn is_premium(&self) -> bool {
        self.role.is_premium()
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn RoleStore>,
}

/// Extract the access token from the HttpOnly session cookie
fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(SESSION_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .filter(|token| !token.is_empty())
                    .map(String::from)
            })
        })
}

/// Extract bearer token from Authorization header or HttpOnly cookie
/// Prefers Authorization header but falls back to cookie for browser clients
pub(crate) fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires an authenticated session
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no token in header or cookie");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate_jwt(&auth_state, &token).await {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                role = %auth_user.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that admits only premium members. Must run after [`require_auth`].
pub async fn require_premium(request: Request, next: Next) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>() else {
        return AuthError::MissingAuth.into_response();
    };

    if !auth_user.is_premium() {
        tracing::info!(
            user_id = %auth_user.user_id,
            role = %auth_user.role,
            "require_premium: premium role required"
        );
        return AuthError::InsufficientPermissions.into_response();
    }

    next.run(request).await
}

async fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            AuthError::InvalidToken
        })?;

    let session_valid = auth_state
        .sessions
        .is_valid(&claims.jti, claims.sub)
        .await
        .map_err(|_| AuthError::DatabaseError)?;

    if !session_valid {
        tracing::warn!(jti = %claims.jti, user_id = %claims.sub, "Session revoked or expired");
        return Err(AuthError::InvalidToken);
    }

    // The persisted role is authoritative; the role claim only reflects issuance time
    let user = auth_state
        .users
        .find_user(claims.sub)
        .await
        .map_err(|_| AuthError::DatabaseError)?
        .ok_or(AuthError::InvalidToken)?;

    if !user.enabled {
        return Err(AuthError::AccountDisabled);
    }

    if user.role != claims.role {
        tracing::debug!(
            user_id = %user.id,
            token_role = %claims.role,
            role = %user.role,
            "Token role is stale, using persisted role"
        );
    }

    Ok(AuthUser {
        user_id: user.id,
        email: user.email,
        role: user.role,
        jti: claims.jti,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Account is disabled")]
    AccountDisabled,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::AccountDisabled => (StatusCode::FORBIDDEN, "Account is disabled"),
            AuthError::InsufficientPermissions => (
                StatusCode::FORBIDDEN,
                "A premium membership is required for this feature",
            ),
            AuthError::DatabaseError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
