//! Webhook endpoints: payment providers and identity sync.
//!
//! Providers retry aggressively on anything but a fast 2xx, so every handler
//! follows the same shape: authenticate the delivery, acknowledge
//! immediately, process in a spawned task. A processing failure after the
//! 200 is terminal for that delivery and only shows up in the logs.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;

use studyforge_billing::{DeleteMode, PayPalWebhookEvent, ReadScope};

use crate::error::ApiError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Svix rejects deliveries this far from the signing timestamp.
const SVIX_TOLERANCE_SECS: i64 = 300;

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".into()))?;

    let event = state.billing.stripe.verify_event(&body, signature)?;

    // Acknowledge before processing; Stripe's delivery timeout is short.
    let billing = state.billing.clone();
    tokio::spawn(async move {
        let event_id = event.id.clone();
        if let Err(e) = billing.stripe.process(event).await {
            tracing::error!(event_id = %event_id, error = %e, "Stripe webhook processing failed");
        }
    });

    Ok(axum::http::StatusCode::OK)
}

pub async fn paypal_webhook(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    // PayPal deliveries are unsigned; the processor re-queries the
    // subscription against the live PayPal API before trusting the body, so
    // only parsing happens before the acknowledgement.
    let event: PayPalWebhookEvent = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed paypal event: {e}")))?;

    let billing = state.billing.clone();
    tokio::spawn(async move {
        let event_id = event.id.clone();
        if let Err(e) = billing.paypal.process(event).await {
            tracing::error!(event_id = %event_id, error = %e, "PayPal webhook processing failed");
        }
    });

    Ok(axum::http::StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ClerkEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: ClerkUserData,
}

#[derive(Debug, Deserialize)]
struct ClerkUserData {
    id: String,
    #[serde(default)]
    email_addresses: Vec<ClerkEmailAddress>,
    primary_email_address_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClerkEmailAddress {
    id: String,
    email_address: String,
}

impl ClerkUserData {
    fn primary_email(&self) -> Option<&str> {
        self.primary_email_address_id
            .as_deref()
            .and_then(|primary| {
                self.email_addresses
                    .iter()
                    .find(|e| e.id == primary)
                    .map(|e| e.email_address.as_str())
            })
            .or_else(|| self.email_addresses.first().map(|e| e.email_address.as_str()))
    }
}

/// Svix signature check: HMAC-SHA256 over `"{id}.{timestamp}.{body}"` with
/// the base64-decoded secret, compared against the space-separated
/// `v1,<base64>` entries of the signature header.
fn verify_svix_signature(
    secret: &str,
    msg_id: &str,
    timestamp: &str,
    body: &str,
    signature_header: &str,
) -> bool {
    let ts: i64 = match timestamp.parse() {
        Ok(ts) => ts,
        Err(_) => return false,
    };
    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - ts).abs() > SVIX_TOLERANCE_SECS {
        return false;
    }

    let secret = secret.strip_prefix("whsec_").unwrap_or(secret);
    let Ok(key) = base64::engine::general_purpose::STANDARD.decode(secret) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    mac.update(format!("{msg_id}.{timestamp}.{body}").as_bytes());
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    signature_header.split(' ').any(|entry| {
        entry
            .split_once(',')
            .is_some_and(|(version, sig)| version == "v1" && sig == expected)
    })
}

pub async fn clerk_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let Some(secret) = state.config.clerk_webhook_secret.as_deref() else {
        return Err(ApiError::BadRequest("identity webhook not configured".into()));
    };

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))
    };
    let msg_id = header("svix-id")?;
    let timestamp = header("svix-timestamp")?;
    let signature = header("svix-signature")?;

    if !verify_svix_signature(secret, msg_id, timestamp, &body, signature) {
        tracing::warn!(msg_id = %msg_id, "Identity webhook signature rejected");
        return Err(ApiError::BadRequest("invalid webhook signature".into()));
    }

    let event: ClerkEvent = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed identity event: {e}")))?;

    match event.event_type.as_str() {
        "user.created" | "user.updated" => {
            let Some(email) = event.data.primary_email() else {
                tracing::warn!(clerk_id = %event.data.id, "Identity event without email, skipping");
                return Ok(axum::http::StatusCode::OK);
            };
            let user = state
                .billing
                .store
                .upsert_by_identity(&event.data.id, email)
                .await?;
            tracing::info!(
                user_id = %user.id,
                clerk_id = %event.data.id,
                event_type = %event.event_type,
                "Identity synced"
            );
        }
        "user.deleted" => {
            // Snapshot before the soft delete; afterwards the row is
            // invisible to active-scope reads.
            let existing = state
                .billing
                .store
                .find_by_clerk_id(&event.data.id, ReadScope::ActiveOnly)
                .await?;

            let deleted = state
                .billing
                .store
                .delete_by_clerk_id(&event.data.id, DeleteMode::Soft)
                .await?;

            if let (true, Some(user)) = (deleted, existing) {
                state
                    .billing
                    .subscriptions
                    .send_account_deleted(user.id, &event.data.id, &user.email)
                    .await;
                tracing::info!(user_id = %user.id, clerk_id = %event.data.id, "Account soft-deleted");
            } else {
                tracing::info!(clerk_id = %event.data.id, "Delete event for unknown or already-deleted account");
            }
        }
        other => {
            tracing::info!(event_type = %other, "Received unhandled identity event type");
        }
    }

    Ok(axum::http::StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret_b64: &str, msg_id: &str, timestamp: &str, body: &str) -> String {
        let key = base64::engine::general_purpose::STANDARD
            .decode(secret_b64)
            .unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(format!("{msg_id}.{timestamp}.{body}").as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    const SECRET_B64: &str = "dGVzdC1zZWNyZXQta2V5LTEyMzQ1Njc4OTA=";

    fn now() -> String {
        OffsetDateTime::now_utc().unix_timestamp().to_string()
    }

    #[test]
    fn valid_svix_signature_is_accepted() {
        let ts = now();
        let body = r#"{"type":"user.created"}"#;
        let sig = sign(SECRET_B64, "msg_1", &ts, body);

        assert!(verify_svix_signature(
            &format!("whsec_{SECRET_B64}"),
            "msg_1",
            &ts,
            body,
            &format!("v1,{sig}")
        ));
    }

    #[test]
    fn signature_over_different_body_is_rejected() {
        let ts = now();
        let sig = sign(SECRET_B64, "msg_1", &ts, r#"{"type":"user.created"}"#);

        assert!(!verify_svix_signature(
            &format!("whsec_{SECRET_B64}"),
            "msg_1",
            &ts,
            r#"{"type":"user.deleted"}"#,
            &format!("v1,{sig}")
        ));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let ts = (OffsetDateTime::now_utc().unix_timestamp() - 600).to_string();
        let body = "{}";
        let sig = sign(SECRET_B64, "msg_1", &ts, body);

        assert!(!verify_svix_signature(
            &format!("whsec_{SECRET_B64}"),
            "msg_1",
            &ts,
            body,
            &format!("v1,{sig}")
        ));
    }

    #[test]
    fn multiple_header_entries_match_any_v1() {
        let ts = now();
        let body = "{}";
        let sig = sign(SECRET_B64, "msg_1", &ts, body);

        assert!(verify_svix_signature(
            &format!("whsec_{SECRET_B64}"),
            "msg_1",
            &ts,
            body,
            &format!("v1,garbage v1,{sig}")
        ));
        assert!(!verify_svix_signature(
            &format!("whsec_{SECRET_B64}"),
            "msg_1",
            &ts,
            body,
            &format!("v0,{sig}")
        ));
    }

    #[test]
    fn primary_email_prefers_the_marked_address() {
        let data = ClerkUserData {
            id: "user_1".into(),
            email_addresses: vec![
                ClerkEmailAddress {
                    id: "idn_old".into(),
                    email_address: "old@example.com".into(),
                },
                ClerkEmailAddress {
                    id: "idn_new".into(),
                    email_address: "new@example.com".into(),
                },
            ],
            primary_email_address_id: Some("idn_new".into()),
        };
        assert_eq!(data.primary_email(), Some("new@example.com"));
    }

    #[test]
    fn primary_email_falls_back_to_first_address() {
        let data = ClerkUserData {
            id: "user_1".into(),
            email_addresses: vec![ClerkEmailAddress {
                id: "idn_1".into(),
                email_address: "only@example.com".into(),
            }],
            primary_email_address_id: None,
        };
        assert_eq!(data.primary_email(), Some("only@example.com"));

        let empty = ClerkUserData {
            id: "user_2".into(),
            email_addresses: vec![],
            primary_email_address_id: None,
        };
        assert_eq!(empty.primary_email(), None);
    }
}
