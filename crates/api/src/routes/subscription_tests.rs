// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! HTTP tests for the subscription, session and webhook routes
//!
//! Drive the full router against in-memory stores and the stub gateway.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Request,
    http::{header, Method, StatusCode},
    response::Response,
    Router,
};
use nagoyameshi_billing::testing::{
    checkout_completed_event, session_id_from_url, subscription_event, StubGateway,
};
use nagoyameshi_billing::{
    BillingService, IdempotencyLedger, InMemoryIdempotencyLedger, InMemoryRoleStore, RoleStore,
};
use nagoyameshi_shared::{Role, User};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::auth::{hash_password, InMemorySessionStore, JwtManager, SessionStore};
use crate::state::AppState;

const JWT_SECRET: &str = "test-jwt-secret-key-for-testing-only-32";

struct TestApp {
    state: AppState,
    users: Arc<InMemoryRoleStore>,
    ledger: Arc<InMemoryIdempotencyLedger>,
    gateway: Arc<StubGateway>,
    sessions: Arc<InMemorySessionStore>,
}

fn test_app() -> TestApp {
    let users = Arc::new(InMemoryRoleStore::new());
    let ledger = Arc::new(InMemoryIdempotencyLedger::new());
    let gateway = Arc::new(StubGateway::new());
    let sessions = Arc::new(InMemorySessionStore::new());

    let billing = BillingService::with_parts(users.clone(), ledger.clone(), gateway.clone());
    let state = AppState::from_parts(
        billing,
        sessions.clone(),
        JwtManager::new(JWT_SECRET, 24),
        false,
    );

    TestApp {
        state,
        users,
        ledger,
        gateway,
        sessions,
    }
}

impl TestApp {
    fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    async fn user(&self, role: Role, customer_id: Option<&str>) -> User {
        let mut user = User::new(
            format!("{}@example.com", Uuid::new_v4().simple()),
            "Member",
            "unused",
        );
        user.enabled = true;
        user.role = role;
        user.stripe_customer_id = customer_id.map(str::to_string);
        self.users.insert_user(user.clone()).await;
        user
    }

    /// Log `user` in without going through the password check
    async fn token(&self, user: &User) -> (String, String) {
        let session = self.state.refresher.issue(user).await.unwrap();
        (session.access_token, session.principal.jti)
    }

    async fn reload(&self, id: Uuid) -> User {
        self.users.find_user(id).await.unwrap().unwrap()
    }

    async fn send(&self, request: Request) -> Response {
        self.router().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str, token: &str) -> Response {
        self.send(authed(Method::GET, uri, token)).await
    }

    async fn post(&self, uri: &str, token: &str) -> Response {
        self.send(authed(Method::POST, uri, token)).await
    }

    async fn deliver(&self, payload: &str) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/stripe/webhook")
            .header("stripe-signature", self.gateway.sign(payload))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        self.send(request).await
    }
}

fn authed(method: Method, uri: &str, token: &str) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_cookie(response: &Response) -> String {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// Health and login
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_login_issues_session_cookie() {
    let app = test_app();
    let mut user = User::new(
        "kenji@example.com",
        "Kenji",
        hash_password("miso-katsu-2024").unwrap(),
    );
    user.enabled = true;
    app.users.insert_user(user.clone()).await;

    let login = |password: &str| {
        Request::builder()
            .method(Method::POST)
            .uri("/api/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "email": "Kenji@Example.com", "password": password }).to_string(),
            ))
            .unwrap()
    };

    let response = app.send(login("wrong-password")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(login("miso-katsu-2024")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = set_cookie(&response);
    assert!(cookie.starts_with("nagoyameshi_session="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));

    let body = json_body(response).await;
    assert_eq!(body["user"]["role"], "USER");
    let token = body["access_token"].as_str().unwrap().to_string();

    let response = app.get("/api/v1/auth/me", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["user_id"], user.id.to_string());
}

#[tokio::test]
async fn test_login_rejects_disabled_account() {
    let app = test_app();
    let user = User::new(
        "pending@example.com",
        "Pending",
        hash_password("tebasaki-wings").unwrap(),
    );
    app.users.insert_user(user).await;

    let response = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "email": "pending@example.com", "password": "tebasaki-wings" })
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_logout_revokes_session() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, _) = app.token(&user).await;

    let response = app.post("/api/v1/auth/logout", &token).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(set_cookie(&response).contains("Max-Age=0"));

    let response = app.get("/api/v1/auth/me", &token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_subscription_routes_require_session() {
    let app = test_app();
    let response = app
        .send(
            Request::builder()
                .uri("/api/v1/subscription")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// =============================================================================
// Checkout and success redirect
// =============================================================================

#[tokio::test]
async fn test_checkout_redirect_promotes_and_refreshes_session() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, old_jti) = app.token(&user).await;

    let response = app.get("/api/v1/premium/access", &token).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.post("/api/v1/subscription/create-session", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let url = json_body(response).await["url"].as_str().unwrap().to_string();
    let session_id = session_id_from_url(&url).unwrap().to_string();
    app.gateway.complete_session(&session_id, "cus_redirect").await;

    let response = app
        .get(
            &format!("/api/v1/subscription/success?session_id={}", session_id),
            &token,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(set_cookie(&response).contains("HttpOnly"));
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["role"], "PREMIUM");
    assert_eq!(body["state"], "active");
    let new_token = body["access_token"].as_str().unwrap().to_string();

    // The token the redirect arrived with is retired
    assert!(!app.sessions.is_valid(&old_jti, user.id).await.unwrap());
    let response = app.get("/api/v1/subscription", &token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/api/v1/premium/access", &new_token).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = app.reload(user.id).await;
    assert_eq!(stored.role, Role::Premium);
    assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_redirect"));

    // The provider's webhook for the same checkout arrives afterwards
    let payload = checkout_completed_event("evt_after_redirect", &session_id, user.id, "cus_redirect");
    let response = app.deliver(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "already_processed");
    assert_eq!(app.reload(user.id).await.version, stored.version);
}

#[tokio::test]
async fn test_success_redirect_requires_session_id() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, _) = app.token(&user).await;

    let response = app.get("/api/v1/subscription/success", &token).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_success_redirect_with_malformed_session_id() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, old_jti) = app.token(&user).await;

    let response = app
        .get("/api/v1/subscription/success?session_id=not-a-session", &token)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "INVALID_SESSION_ID");
    assert!(app.sessions.is_valid(&old_jti, user.id).await.unwrap());
}

#[tokio::test]
async fn test_success_redirect_before_payment_settles() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, old_jti) = app.token(&user).await;

    let response = app.post("/api/v1/subscription/create-session", &token).await;
    let url = json_body(response).await["url"].as_str().unwrap().to_string();
    let session_id = session_id_from_url(&url).unwrap().to_string();

    let response = app
        .get(
            &format!("/api/v1/subscription/success?session_id={}", session_id),
            &token,
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(
        json_body(response).await["error"]["code"],
        "CHECKOUT_NOT_COMPLETED"
    );
    assert_eq!(app.reload(user.id).await.role, Role::User);
    assert!(app.sessions.is_valid(&old_jti, user.id).await.unwrap());
    assert!(app.ledger.is_empty().await);
}

#[tokio::test]
async fn test_success_redirect_for_someone_elses_session() {
    let app = test_app();
    let owner = app.user(Role::User, None).await;
    let intruder = app.user(Role::User, None).await;
    let (owner_token, _) = app.token(&owner).await;
    let (intruder_token, _) = app.token(&intruder).await;

    let response = app
        .post("/api/v1/subscription/create-session", &owner_token)
        .await;
    let url = json_body(response).await["url"].as_str().unwrap().to_string();
    let session_id = session_id_from_url(&url).unwrap().to_string();
    app.gateway.complete_session(&session_id, "cus_owner").await;

    let response = app
        .get(
            &format!("/api/v1/subscription/success?session_id={}", session_id),
            &intruder_token,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.reload(intruder.id).await.role, Role::User);
    assert_eq!(app.reload(owner.id).await.role, Role::User);
}

#[tokio::test]
async fn test_checkout_when_already_premium() {
    let app = test_app();
    let user = app.user(Role::Premium, Some("cus_existing")).await;
    let (token, _) = app.token(&user).await;

    let response = app.post("/api/v1/subscription/create-session", &token).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"]["code"], "ALREADY_SUBSCRIBED");
    assert!(app.gateway.checkouts().await.is_empty());
}

#[tokio::test]
async fn test_checkout_during_gateway_outage() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, _) = app.token(&user).await;
    app.gateway.set_unavailable(true).await;

    let response = app.post("/api/v1/subscription/create-session", &token).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "GATEWAY_UNAVAILABLE");
    assert_eq!(app.reload(user.id).await.role, Role::User);
}

#[tokio::test]
async fn test_checkout_cancel_is_acknowledged() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, _) = app.token(&user).await;

    let response = app.get("/api/v1/subscription/cancel", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "cancelled");
    assert_eq!(app.reload(user.id).await.role, Role::User);
}

// =============================================================================
// Unsubscribe and session consistency
// =============================================================================

#[tokio::test]
async fn test_unsubscribe_demotes_and_next_request_sees_user() {
    let app = test_app();
    let user = app.user(Role::Premium, Some("cus_leaving")).await;
    let (token, old_jti) = app.token(&user).await;

    let response = app.get("/api/v1/premium/access", &token).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.post("/api/v1/subscription/unsubscribe", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = set_cookie(&response);
    assert!(cookie.contains("HttpOnly"));
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["role"], "USER");
    assert_eq!(body["principal"]["role"], "USER");
    assert_eq!(body["provider_cancellation"]["status"], "cancelled");
    let new_token = body["access_token"].as_str().unwrap().to_string();

    // The refreshed session is already demoted
    let response = app.get("/api/v1/premium/access", &new_token).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app.get("/api/v1/auth/me", &new_token).await;
    assert_eq!(json_body(response).await["role"], "USER");

    // The pre-unsubscribe token can no longer be used
    let response = app.get("/api/v1/premium/access", &token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(!app.sessions.is_valid(&old_jti, user.id).await.unwrap());

    assert_eq!(app.reload(user.id).await.role, Role::User);
    assert_eq!(app.gateway.cancelled_customers().await, vec!["cus_leaving"]);
}

#[tokio::test]
async fn test_unsubscribe_survives_provider_outage() {
    let app = test_app();
    let user = app.user(Role::Premium, Some("cus_outage")).await;
    let (token, _) = app.token(&user).await;
    app.gateway.set_unavailable(true).await;

    let response = app.post("/api/v1/subscription/unsubscribe", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["provider_cancellation"]["status"], "failed");
    assert_eq!(app.reload(user.id).await.role, Role::User);
}

#[tokio::test]
async fn test_unsubscribe_when_not_subscribed() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, _) = app.token(&user).await;

    let response = app.post("/api/v1/subscription/unsubscribe", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "unchanged");
    assert_eq!(body["provider_cancellation"]["status"], "skipped");
    assert!(body["access_token"].is_string());
}

#[tokio::test]
async fn test_replayed_activation_after_unsubscribe_stays_user() {
    let app = test_app();
    let user = app.user(Role::User, None).await;

    let activation = checkout_completed_event("evt_first", "cs_replayed", user.id, "cus_replay");
    let response = app.deliver(&activation).await;
    assert_eq!(json_body(response).await["outcome"], "applied");

    let (token, _) = app.token(&app.reload(user.id).await).await;
    let response = app.post("/api/v1/subscription/unsubscribe", &token).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.deliver(&activation).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "already_processed");
    assert_eq!(app.reload(user.id).await.role, Role::User);
}

// =============================================================================
// Customer portal and status
// =============================================================================

#[tokio::test]
async fn test_customer_portal_requires_customer_record() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let (token, _) = app.token(&user).await;

    let response = app
        .post("/api/v1/subscription/customer-portal", &token)
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"]["code"], "NO_CUSTOMER_RECORD");
}

#[tokio::test]
async fn test_customer_portal_url() {
    let app = test_app();
    let user = app.user(Role::Premium, Some("cus_portal")).await;
    let (token, _) = app.token(&user).await;

    let response = app
        .post("/api/v1/subscription/customer-portal", &token)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let url = json_body(response).await["url"].as_str().unwrap().to_string();
    assert!(url.ends_with("cus_portal"));
}

#[tokio::test]
async fn test_status_reports_persisted_state() {
    let app = test_app();
    let user = app.user(Role::Premium, Some("cus_status")).await;
    let (token, _) = app.token(&user).await;

    let response = app.get("/api/v1/subscription", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "active");
    assert_eq!(body["role"], "PREMIUM");
    assert_eq!(body["has_customer_record"], true);
}

// =============================================================================
// Webhook endpoint
// =============================================================================

#[tokio::test]
async fn test_webhook_without_signature_rejected() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let payload = checkout_completed_event("evt_unsigned", "cs_unsigned", user.id, "cus_x");

    let response = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/stripe/webhook")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.reload(user.id).await.role, Role::User);
    assert!(app.ledger.is_empty().await);
}

#[tokio::test]
async fn test_webhook_with_forged_signature_rejected() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let payload = checkout_completed_event("evt_forged", "cs_forged", user.id, "cus_x");
    let forged = nagoyameshi_billing::testing::signature_header("whsec_attacker", &payload);

    let response = app
        .send(
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/stripe/webhook")
                .header("stripe-signature", forged)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "SIGNATURE_INVALID");
    assert_eq!(app.reload(user.id).await.role, Role::User);
    assert!(app.ledger.is_empty().await);
}

#[tokio::test]
async fn test_webhook_for_unknown_user() {
    let app = test_app();
    let payload = checkout_completed_event("evt_ghost", "cs_ghost", Uuid::new_v4(), "cus_ghost");

    let response = app.deliver(&payload).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(app.ledger.find("evt_ghost").await.unwrap().is_none());
    assert!(app.ledger.is_empty().await);
}

#[tokio::test]
async fn test_webhook_redelivery_is_idempotent() {
    let app = test_app();
    let user = app.user(Role::User, None).await;
    let payload = checkout_completed_event("evt_once", "cs_once", user.id, "cus_once");

    let response = app.deliver(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "applied");
    let promoted = app.reload(user.id).await;
    assert_eq!(promoted.role, Role::Premium);

    let response = app.deliver(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "already_processed");
    assert_eq!(app.reload(user.id).await.version, promoted.version);
    assert!(app.ledger.find("evt_once").await.unwrap().is_some());
}

#[tokio::test]
async fn test_webhook_subscription_deleted_demotes_by_customer() {
    let app = test_app();
    let user = app.user(Role::Premium, Some("cus_deleted")).await;
    let payload = subscription_event(
        "evt_deleted",
        "customer.subscription.deleted",
        "canceled",
        None,
        "cus_deleted",
    );

    let response = app.deliver(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["outcome"], "applied");
    assert_eq!(app.reload(user.id).await.role, Role::User);
}

#[tokio::test]
async fn test_webhook_ignored_event_type() {
    let app = test_app();
    let payload = json!({
        "id": "evt_invoice",
        "type": "invoice.paid",
        "created": 1_700_000_000,
        "data": { "object": { "id": "in_1" } }
    })
    .to_string();

    let response = app.deliver(&payload).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["outcome"], "ignored");
    assert_eq!(body["ignored_event_type"], "invoice.paid");
    assert!(app.ledger.is_empty().await);
}
