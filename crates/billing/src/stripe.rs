//! Stripe webhook verification and canonical mapping.
//!
//! Stripe signs every delivery; we verify the `Stripe-Signature` header
//! (HMAC-SHA256 over `"{timestamp}.{payload}"`) before trusting anything in
//! the body. The payload itself is parsed with local structs covering only
//! the fields this core needs; the provider SDK is deliberately not a
//! dependency.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::store::{ReadScope, UserStore};
use crate::subscriptions::{SubscriptionService, SubscriptionUpdate};
use studyforge_shared::{SubscriptionPlan, SubscriptionStatus};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamps older than this are rejected (replay protection).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A first paid cycle no longer than this is treated as a trial. Heuristic:
/// Stripe's shortest real billing interval is a month, so a shorter first
/// cycle means a trial period was configured on the subscription.
pub const TRIAL_WINDOW_DAYS: i64 = 15;

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> Self {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
        if webhook_secret.is_empty() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - Stripe webhooks will be rejected");
        }
        Self { webhook_secret }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub start_date: Option<i64>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub items: StripeItemList,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StripeItemList {
    #[serde(default)]
    pub data: Vec<StripeItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeItem {
    pub price: Option<StripePrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: String,
    pub recurring: Option<StripeRecurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeRecurring {
    pub interval: Option<String>,
}

fn unix_ts(t: Option<i64>) -> Option<OffsetDateTime> {
    t.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

/// True when this is the subscription's first cycle and it is short enough
/// to be a configured trial rather than a real billing period.
fn is_short_first_cycle(sub: &StripeSubscription) -> bool {
    match (
        sub.start_date,
        sub.current_period_start,
        sub.current_period_end,
    ) {
        (Some(start), Some(period_start), Some(period_end)) if period_start == start => {
            period_end - period_start <= TRIAL_WINDOW_DAYS * 86_400
        }
        _ => false,
    }
}

/// Translate a Stripe subscription object into canonical vocabulary.
///
/// Unrecognized provider sub-statuses (incomplete, unpaid, paused, ...) map
/// conservatively to `free` rather than guessing an optimistic status.
pub fn map_subscription(event_type: &str, sub: &StripeSubscription) -> SubscriptionUpdate {
    let plan = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .and_then(|price| price.recurring.as_ref())
        .and_then(|recurring| recurring.interval.as_deref())
        .and_then(SubscriptionPlan::from_interval);

    let period_end = unix_ts(sub.current_period_end);

    let status = if event_type == "customer.subscription.deleted" {
        // The subscription has truly ended: immediate downgrade, no grace.
        SubscriptionStatus::Free
    } else {
        match sub.status.as_deref() {
            Some("trialing") => SubscriptionStatus::Trialing,
            Some("active") if sub.cancel_at_period_end => SubscriptionStatus::Cancelled,
            Some("active") if is_short_first_cycle(sub) => SubscriptionStatus::Trialing,
            Some("active") => SubscriptionStatus::Active,
            Some("canceled") | Some("cancelled") => SubscriptionStatus::Cancelled,
            Some("past_due") => SubscriptionStatus::OnHold,
            other => {
                tracing::info!(
                    subscription_id = %sub.id,
                    provider_status = ?other,
                    "Unrecognized Stripe status, mapping conservatively to free"
                );
                SubscriptionStatus::Free
            }
        }
    };

    let ends_at = match status {
        SubscriptionStatus::Trialing => unix_ts(sub.trial_end).or(period_end),
        SubscriptionStatus::Active | SubscriptionStatus::Cancelled => period_end,
        _ => None,
    };

    SubscriptionUpdate {
        status,
        plan,
        subscription_id: Some(sub.id.clone()),
        customer_id: sub.customer.clone(),
        ends_at,
        period_end,
        provider_event: event_type.to_string(),
    }
}

#[derive(Clone)]
pub struct StripeWebhookProcessor {
    config: StripeConfig,
    store: UserStore,
    subscriptions: SubscriptionService,
}

impl StripeWebhookProcessor {
    pub fn new(config: StripeConfig, store: UserStore, subscriptions: SubscriptionService) -> Self {
        Self {
            config,
            store,
            subscriptions,
        }
    }

    /// Verify the `Stripe-Signature` header and parse the event.
    ///
    /// Header format: `t=<unix>,v1=<hex hmac>[,v0=...]`. The signed payload
    /// is `"{t}.{body}"` keyed with the endpoint's webhook secret.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<StripeEvent> {
        if self.config.webhook_secret.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => v1_signature = Some(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Stripe webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret = self
            .config
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.config.webhook_secret);
        let signed_payload = format!("{timestamp}.{payload}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Stripe webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: StripeEvent = serde_json::from_str(payload)?;
        Ok(event)
    }

    /// Process a verified event. Runs after the HTTP 200 has been returned;
    /// errors here are terminal for this delivery (no automatic retry).
    pub async fn process(&self, event: StripeEvent) -> BillingResult<()> {
        match event.event_type.as_str() {
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => self.handle_subscription_event(event).await,
            other => {
                tracing::info!(
                    event_type = %other,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_subscription_event(&self, event: StripeEvent) -> BillingResult<()> {
        let sub: StripeSubscription = serde_json::from_value(event.data.object.clone())?;

        let user = self.lookup_user(&sub).await?;
        let update = map_subscription(&event.event_type, &sub);

        let outcome = self.subscriptions.apply(&user, update, "stripe").await?;
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            subscription_id = %sub.id,
            user_id = %user.id,
            applied = outcome.applied,
            "Stripe subscription event processed"
        );
        Ok(())
    }

    /// Resolve the affected user: billing customer id first, then the clerk
    /// id we stamp into subscription metadata at checkout.
    async fn lookup_user(
        &self,
        sub: &StripeSubscription,
    ) -> BillingResult<crate::store::UserRecord> {
        if let Some(customer) = sub.customer.as_deref() {
            if let Some(user) = self
                .store
                .find_by_customer_id(customer, ReadScope::ActiveOnly)
                .await?
            {
                return Ok(user);
            }
        }

        if let Some(clerk_id) = sub.metadata.get("clerk_id") {
            if let Some(user) = self
                .store
                .find_by_clerk_id(clerk_id, ReadScope::ActiveOnly)
                .await?
            {
                return Ok(user);
            }
        }

        Err(BillingError::UserNotFound(format!(
            "no user for stripe subscription {}",
            sub.id
        )))
    }
}
