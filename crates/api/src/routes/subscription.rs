//! Subscription endpoints
//!
//! The success redirect and unsubscribe change the caller's role, so both end
//! by refreshing the session: the response carries a new token reflecting the
//! persisted role and the token the request arrived with is revoked.

use axum::{
    extract::{Extension, Query, State},
    response::Response,
    Json,
};
use nagoyameshi_billing::{ProviderCancellation, SubscriptionStatus, TransitionOutcome};
use nagoyameshi_shared::{Role, SubscriptionState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::with_session_cookie;
use crate::{
    auth::{AuthUser, IssuedSession},
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SuccessQuery {
    pub session_id: Option<String>,
}

/// Body of every response that follows a role change attempt
#[derive(Debug, Serialize)]
pub struct RoleChangeResponse {
    pub outcome: &'static str,
    pub state: SubscriptionState,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_cancellation: Option<ProviderCancellation>,
    #[serde(flatten)]
    pub session: IssuedSession,
}

/// GET /subscription
pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatus>> {
    let status = state
        .billing
        .subscriptions
        .status(auth_user.user_id)
        .await?;
    Ok(Json(status))
}

/// POST /subscription/create-session
pub async fn create_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let url = state
        .billing
        .subscriptions
        .start_checkout(auth_user.user_id)
        .await
        .inspect_err(|e| {
            tracing::warn!(user_id = %auth_user.user_id, error = %e, "Could not start checkout");
        })?;

    Ok(Json(json!({ "url": url })))
}

/// GET /subscription/success?session_id=
///
/// Optimistic activation; the webhook for the same checkout stays authoritative
/// and becomes a no-op once this has applied.
pub async fn success(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<SuccessQuery>,
) -> ApiResult<Response> {
    let session_id = query
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("session_id is required".to_string()))?;

    let outcome = state
        .billing
        .subscriptions
        .confirm_checkout_redirect(auth_user.user_id, session_id)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        session_id = %session_id,
        outcome = outcome.as_str(),
        "Checkout success redirect handled"
    );

    respond_with_refresh(&state, &auth_user, outcome, None).await
}

/// GET /subscription/cancel
pub async fn cancel(Extension(auth_user): Extension<AuthUser>) -> Json<Value> {
    tracing::info!(user_id = %auth_user.user_id, "Checkout cancelled by user");
    Json(json!({
        "status": "cancelled",
        "message": "Checkout was cancelled. Your membership has not changed.",
    }))
}

/// POST /subscription/unsubscribe
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Response> {
    let result = state
        .billing
        .subscriptions
        .unsubscribe(auth_user.user_id)
        .await?;

    respond_with_refresh(
        &state,
        &auth_user,
        result.transition,
        Some(result.provider_cancellation),
    )
    .await
}

/// POST /subscription/customer-portal
pub async fn customer_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    let url = state
        .billing
        .subscriptions
        .open_customer_portal(auth_user.user_id)
        .await?;

    Ok(Json(json!({ "url": url })))
}

async fn respond_with_refresh(
    state: &AppState,
    auth_user: &AuthUser,
    outcome: TransitionOutcome,
    provider_cancellation: Option<ProviderCancellation>,
) -> ApiResult<Response> {
    let label = outcome.as_str();
    let user = outcome.into_user();
    let session = state.refresher.refresh(&user, auth_user).await?;

    let token = session.access_token.clone();
    Ok(with_session_cookie(
        state,
        &token,
        Json(RoleChangeResponse {
            outcome: label,
            state: user.subscription_state(),
            role: user.role,
            provider_cancellation,
            session,
        }),
    ))
}
