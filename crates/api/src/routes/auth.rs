//! Login, current principal and logout

use axum::{
    extract::{Extension, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{session_cookie, with_session_cookie};
use crate::{
    auth::{sessions::REASON_LOGOUT, verify_password, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Exchange email and password for a session
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let email = req.email.trim();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "Email and password are required".to_string(),
        ));
    }

    let Some(user) = state.users.find_user_by_email(email).await? else {
        tracing::info!("Login attempt for unknown email");
        return Err(ApiError::InvalidCredentials);
    };

    let password_ok = verify_password(&req.password, &user.password_hash).unwrap_or_else(|e| {
        tracing::error!(user_id = %user.id, error = %e, "Stored password hash is unreadable");
        false
    });
    if !password_ok {
        tracing::info!(user_id = %user.id, "Login rejected: wrong password");
        return Err(ApiError::InvalidCredentials);
    }

    if !user.enabled {
        return Err(ApiError::AccountDisabled);
    }

    let session = state.refresher.issue(&user).await?;
    tracing::info!(user_id = %user.id, role = %user.role, "User logged in");

    let token = session.access_token.clone();
    Ok(with_session_cookie(
        &state,
        &token,
        Json(json!({
            "access_token": session.access_token,
            "token_type": "Bearer",
            "expires_at": session.expires_at.unix_timestamp(),
            "user": session.principal,
        })),
    ))
}

/// The live principal for this session
pub async fn me(Extension(auth_user): Extension<AuthUser>) -> Json<AuthUser> {
    Json(auth_user)
}

/// Revoke the session this request arrived with
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Response> {
    state.sessions.revoke(&auth_user.jti, REASON_LOGOUT).await?;
    tracing::info!(user_id = %auth_user.user_id, "User logged out");

    let cleared = session_cookie(&state, "", 0);
    Ok(([(header::SET_COOKIE, cleared)], StatusCode::NO_CONTENT).into_response())
}
