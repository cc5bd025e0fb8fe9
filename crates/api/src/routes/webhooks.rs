//! Stripe webhook ingestion

use axum::{extract::State, http::HeaderMap, Json};
use nagoyameshi_billing::{BillingError, WebhookOutcome};
use serde_json::{json, Value};

use crate::{error::ApiResult, state::AppState};

/// POST /stripe/webhook
///
/// Nothing is read from the body before the signature has been verified.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            BillingError::SignatureInvalid
        })?;

    let outcome = state.billing.webhooks.handle(&body, signature).await?;

    let event_type = match &outcome {
        WebhookOutcome::Ignored { event_type } => Some(event_type.clone()),
        WebhookOutcome::Transition(_) => None,
    };

    Ok(Json(json!({
        "received": true,
        "outcome": outcome.as_str(),
        "ignored_event_type": event_type,
    })))
}
