//! PayPal subscription claim endpoint.
//!
//! PayPal's approval flow finishes in the browser, so the client posts the
//! subscription id back to us. The id is attacker-controlled input; nothing
//! is persisted until the verifier has re-queried it against the live PayPal
//! API. Unlike the webhook handlers, this runs synchronously: the caller is
//! our own frontend waiting to unlock the UI.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use studyforge_billing::{ReadScope, SubscriptionUpdate};
use studyforge_shared::SubscriptionStatus;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub subscription_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub applied: bool,
    pub status: String,
    pub blocked_reason: Option<String>,
}

pub async fn claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    // The frontend proxy resolves the session and forwards the clerk id; an
    // absent header means the request did not come through it.
    let clerk_id = headers
        .get("x-clerk-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    if request.subscription_id.trim().is_empty() {
        return Err(ApiError::BadRequest("subscription_id is required".into()));
    }

    let user = state
        .billing
        .store
        .find_by_clerk_id(clerk_id, ReadScope::ActiveOnly)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    let verification = state.billing.verifier.verify(&request.subscription_id).await;
    if !verification.is_valid {
        tracing::warn!(
            user_id = %user.id,
            subscription_id = %request.subscription_id,
            error = ?verification.error,
            "Rejected subscription claim"
        );
        return Err(ApiError::Forbidden(
            "subscription could not be verified".into(),
        ));
    }

    let status = if verification.is_trial {
        SubscriptionStatus::Trialing
    } else {
        SubscriptionStatus::Active
    };
    let plan = verification
        .plan_id
        .as_deref()
        .and_then(|id| state.billing.paypal_config.plan_for(id));

    let update = SubscriptionUpdate {
        status,
        plan,
        subscription_id: Some(request.subscription_id.clone()),
        customer_id: None,
        ends_at: verification.next_billing_date,
        period_end: verification.next_billing_date,
        provider_event: "subscription.claim".to_string(),
    };

    let outcome = state
        .billing
        .subscriptions
        .apply(&user, update, "paypal_claim")
        .await?;

    tracing::info!(
        user_id = %user.id,
        subscription_id = %request.subscription_id,
        applied = outcome.applied,
        status = %outcome.status,
        "Subscription claim processed"
    );

    Ok(Json(ClaimResponse {
        applied: outcome.applied,
        status: outcome.status.as_str().to_string(),
        blocked_reason: outcome.blocked_reason,
    }))
}
