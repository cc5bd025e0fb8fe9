//! API routes

pub mod auth;
pub mod health;
pub mod premium;
pub mod subscription;
pub mod webhooks;

#[cfg(test)]
mod subscription_tests;

use axum::{
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::{
    auth::{require_auth, require_premium, SESSION_COOKIE},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no session required)
    let public_api_routes = Router::new()
        .route("/auth/login", post(auth::login))
        // Authenticated by the provider's signature instead of a session
        .route("/stripe/webhook", post(webhooks::stripe_webhook));

    let protected_api_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/auth/logout", post(auth::logout))
        .route("/subscription", get(subscription::status))
        .route("/subscription/create-session", post(subscription::create_session))
        .route("/subscription/success", get(subscription::success))
        .route("/subscription/cancel", get(subscription::cancel))
        .route("/subscription/unsubscribe", post(subscription::unsubscribe))
        .route("/subscription/customer-portal", post(subscription::customer_portal))
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    let premium_api_routes = Router::new()
        .route("/premium/access", get(premium::access))
        .route_layer(middleware::from_fn(require_premium))
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_routes = public_api_routes
        .merge(protected_api_routes)
        .merge(premium_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .with_state(state)
}

/// `Set-Cookie` value carrying a session token
pub(crate) fn session_cookie(state: &AppState, token: &str, max_age_secs: i64) -> String {
    let secure = if state.secure_cookies { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
        SESSION_COOKIE, token, max_age_secs, secure
    )
}

/// Attach a session cookie to a response
pub(crate) fn with_session_cookie(state: &AppState, token: &str, response: impl IntoResponse) -> Response {
    let cookie = session_cookie(state, token, state.refresher.token_lifetime_secs());
    ([(header::SET_COOKIE, cookie)], response).into_response()
}
