//! PayPal subscription verification and webhook mapping.
//!
//! PayPal differs from Stripe in two ways that shape this module. First, the
//! client hands us subscription ids directly (the claim endpoint), so nothing
//! client-supplied is trusted: every claim is re-queried live against the
//! PayPal API. Second, PayPal's webhook payloads carry RFC 3339 timestamps
//! and a plan id instead of a billing interval, so plan mapping goes through
//! configured plan ids.

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::store::{ReadScope, UserStore};
use crate::stripe::TRIAL_WINDOW_DAYS;
use crate::subscriptions::{SubscriptionService, SubscriptionUpdate};
use studyforge_shared::{SubscriptionPlan, SubscriptionStatus};

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_base: String,
    pub monthly_plan_id: Option<String>,
    pub yearly_plan_id: Option<String>,
}

impl PayPalConfig {
    pub fn from_env() -> Self {
        let client_id = std::env::var("PAYPAL_CLIENT_ID").ok().filter(|v| !v.is_empty());
        let client_secret = std::env::var("PAYPAL_CLIENT_SECRET")
            .ok()
            .filter(|v| !v.is_empty());
        if client_id.is_none() || client_secret.is_none() {
            tracing::warn!(
                "PAYPAL_CLIENT_ID / PAYPAL_CLIENT_SECRET not set - \
                 PayPal subscriptions cannot be verified against the live API"
            );
        }

        Self {
            client_id,
            client_secret,
            api_base: std::env::var("PAYPAL_API_BASE")
                .unwrap_or_else(|_| "https://api-m.paypal.com".to_string()),
            monthly_plan_id: std::env::var("PAYPAL_MONTHLY_PLAN_ID").ok(),
            yearly_plan_id: std::env::var("PAYPAL_YEARLY_PLAN_ID").ok(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    /// Map a PayPal plan id to a canonical plan via configuration.
    pub fn plan_for(&self, plan_id: &str) -> Option<SubscriptionPlan> {
        if self.monthly_plan_id.as_deref() == Some(plan_id) {
            Some(SubscriptionPlan::Monthly)
        } else if self.yearly_plan_id.as_deref() == Some(plan_id) {
            Some(SubscriptionPlan::Yearly)
        } else {
            None
        }
    }
}

fn parse_rfc3339(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
}

/// Same heuristic as the Stripe mapping: a first billing gap no longer than
/// the trial window means the subscription started with a trial.
fn is_trial_window(start: Option<OffsetDateTime>, next_billing: Option<OffsetDateTime>) -> bool {
    match (start, next_billing) {
        (Some(start), Some(next)) => (next - start).whole_days() <= TRIAL_WINDOW_DAYS,
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayPalBillingInfo {
    pub next_billing_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayPalSubscriber {
    pub email_address: Option<String>,
}

/// The subscription resource shape shared by the live API response and the
/// `BILLING.SUBSCRIPTION.*` webhook payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSubscriptionResource {
    pub id: String,
    pub status: Option<String>,
    pub plan_id: Option<String>,
    pub start_time: Option<String>,
    pub custom_id: Option<String>,
    #[serde(default)]
    pub subscriber: PayPalSubscriber,
    #[serde(default)]
    pub billing_info: PayPalBillingInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSaleResource {
    pub id: String,
    /// For subscription payments this carries the subscription id.
    pub billing_agreement_id: Option<String>,
    pub create_time: Option<String>,
}

/// The billing period a renewal payment belongs to, for receipt keying. The
/// sale's own timestamp identifies the period; the stored period end is the
/// fallback for payloads without one.
fn sale_period(
    sale: &PayPalSaleResource,
    stored_period_end: Option<OffsetDateTime>,
) -> Option<OffsetDateTime> {
    parse_rfc3339(sale.create_time.as_deref()).or(stored_period_end)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalWebhookEvent {
    pub id: String,
    pub event_type: String,
    pub resource: serde_json::Value,
}

/// Outcome of a live lookup for one subscription id.
#[derive(Debug, Clone)]
pub struct SubscriptionVerification {
    pub is_valid: bool,
    pub status: Option<String>,
    pub plan_id: Option<String>,
    pub is_trial: bool,
    pub next_billing_date: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl SubscriptionVerification {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            status: None,
            plan_id: None,
            is_trial: false,
            next_billing_date: None,
            error: Some(error.into()),
        }
    }
}

/// Live re-query of a subscription against the PayPal API.
///
/// When server credentials are missing the verifier cannot check anything;
/// with `fail_open` (the default) it then reports the claim as valid but
/// unverified, loudly. Claims for ids PayPal does not recognize are always
/// invalid regardless of the policy.
#[derive(Clone)]
pub struct PayPalVerifier {
    client: reqwest::Client,
    config: PayPalConfig,
    fail_open: bool,
}

impl PayPalVerifier {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            fail_open: true,
        }
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    async fn fetch_token(&self) -> BillingResult<String> {
        let (Some(client_id), Some(client_secret)) =
            (&self.config.client_id, &self.config.client_secret)
        else {
            return Err(BillingError::VerificationFailed(
                "paypal credentials not configured".into(),
            ));
        };

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BillingError::VerificationFailed(format!(
                "paypal token endpoint returned {}",
                response.status()
            )));
        }

        let token: OAuthTokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn fetch_subscription(
        &self,
        token: &str,
        subscription_id: &str,
    ) -> BillingResult<Option<PayPalSubscriptionResource>> {
        let response = self
            .client
            .get(format!(
                "{}/v1/billing/subscriptions/{}",
                self.config.api_base, subscription_id
            ))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(BillingError::VerificationFailed(format!(
                "paypal subscription lookup returned {}",
                response.status()
            )));
        }

        let resource: PayPalSubscriptionResource = response.json().await?;
        Ok(Some(resource))
    }

    pub async fn verify(&self, subscription_id: &str) -> SubscriptionVerification {
        if !self.config.has_credentials() {
            tracing::warn!(
                subscription_id = %subscription_id,
                fail_open = self.fail_open,
                "PayPal credentials not configured - accepting claim UNVERIFIED"
            );
            return SubscriptionVerification {
                is_valid: self.fail_open,
                status: None,
                plan_id: None,
                is_trial: false,
                next_billing_date: None,
                error: Some("credentials not configured, claim unverified".into()),
            };
        }

        let token = match self.fetch_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    fail_open = self.fail_open,
                    "PayPal token fetch failed"
                );
                let mut outcome = SubscriptionVerification::invalid(e.to_string());
                outcome.is_valid = self.fail_open;
                return outcome;
            }
        };

        match self.fetch_subscription(&token, subscription_id).await {
            Ok(Some(resource)) => {
                let is_active = resource.status.as_deref() == Some("ACTIVE");
                let start = parse_rfc3339(resource.start_time.as_deref());
                let next_billing =
                    parse_rfc3339(resource.billing_info.next_billing_time.as_deref());
                SubscriptionVerification {
                    is_valid: is_active,
                    status: resource.status,
                    plan_id: resource.plan_id,
                    is_trial: is_trial_window(start, next_billing),
                    next_billing_date: next_billing,
                    error: (!is_active).then(|| "subscription is not active".to_string()),
                }
            }
            // PayPal does not know this id: a bad or forged claim, never
            // fail-open.
            Ok(None) => SubscriptionVerification::invalid("subscription not found"),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    fail_open = self.fail_open,
                    "PayPal subscription lookup failed"
                );
                let mut outcome = SubscriptionVerification::invalid(e.to_string());
                outcome.is_valid = self.fail_open;
                outcome
            }
        }
    }
}

/// Map a `BILLING.SUBSCRIPTION.*` event to a canonical update.
pub fn map_subscription_event(
    event_type: &str,
    resource: &PayPalSubscriptionResource,
    config: &PayPalConfig,
) -> Option<SubscriptionUpdate> {
    let start = parse_rfc3339(resource.start_time.as_deref());
    let next_billing = parse_rfc3339(resource.billing_info.next_billing_time.as_deref());
    let plan = resource.plan_id.as_deref().and_then(|id| config.plan_for(id));

    let (status, ends_at) = match event_type {
        "BILLING.SUBSCRIPTION.ACTIVATED" => {
            if is_trial_window(start, next_billing) {
                (SubscriptionStatus::Trialing, next_billing)
            } else {
                (SubscriptionStatus::Active, next_billing)
            }
        }
        // Access continues until the already-paid period runs out.
        "BILLING.SUBSCRIPTION.CANCELLED" => (SubscriptionStatus::Cancelled, next_billing),
        "BILLING.SUBSCRIPTION.SUSPENDED" => (SubscriptionStatus::OnHold, None),
        "BILLING.SUBSCRIPTION.EXPIRED" => (SubscriptionStatus::Free, None),
        _ => return None,
    };

    Some(SubscriptionUpdate {
        status,
        plan,
        subscription_id: Some(resource.id.clone()),
        customer_id: None,
        ends_at,
        period_end: next_billing,
        provider_event: event_type.to_string(),
    })
}

/// Gate a webhook-delivered subscription event on the live lookup outcome.
///
/// PayPal does not sign these deliveries, so the subscription id in the body
/// is the only thing tying the event to reality. An id PayPal does not
/// recognize is a forgery and is always rejected. Activations additionally
/// require the live status to agree; teardown events (cancel, suspend,
/// expire) only need the subscription to be real, since their live status is
/// legitimately no longer ACTIVE.
fn event_passes_verification(event_type: &str, verification: &SubscriptionVerification) -> bool {
    let recognized = verification.status.is_some();
    if !recognized && !verification.is_valid {
        return false;
    }
    if event_type == "BILLING.SUBSCRIPTION.ACTIVATED" {
        return verification.is_valid;
    }
    true
}

#[derive(Clone)]
pub struct PayPalWebhookProcessor {
    config: PayPalConfig,
    store: UserStore,
    subscriptions: SubscriptionService,
    verifier: PayPalVerifier,
}

impl PayPalWebhookProcessor {
    pub fn new(
        config: PayPalConfig,
        store: UserStore,
        subscriptions: SubscriptionService,
        verifier: PayPalVerifier,
    ) -> Self {
        Self {
            config,
            store,
            subscriptions,
            verifier,
        }
    }

    pub async fn process(&self, event: PayPalWebhookEvent) -> BillingResult<()> {
        match event.event_type.as_str() {
            "BILLING.SUBSCRIPTION.ACTIVATED"
            | "BILLING.SUBSCRIPTION.CANCELLED"
            | "BILLING.SUBSCRIPTION.SUSPENDED"
            | "BILLING.SUBSCRIPTION.EXPIRED" => self.handle_subscription_event(event).await,
            "PAYMENT.SALE.COMPLETED" => self.handle_sale_completed(event).await,
            other => {
                tracing::info!(
                    event_type = %other,
                    event_id = %event.id,
                    "Received unhandled PayPal event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_subscription_event(&self, event: PayPalWebhookEvent) -> BillingResult<()> {
        let resource: PayPalSubscriptionResource =
            serde_json::from_value(event.resource.clone())?;

        // Unsigned delivery: confirm the subscription with PayPal before
        // trusting anything in the body.
        let verification = self.verifier.verify(&resource.id).await;
        if !event_passes_verification(&event.event_type, &verification) {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                subscription_id = %resource.id,
                live_status = ?verification.status,
                "Rejected PayPal webhook event (live lookup did not confirm it)"
            );
            return Err(BillingError::VerificationFailed(format!(
                "paypal did not confirm subscription {}",
                resource.id
            )));
        }

        let user = self.lookup_user(&resource).await?;
        let Some(update) = map_subscription_event(&event.event_type, &resource, &self.config)
        else {
            return Ok(());
        };

        let outcome = self.subscriptions.apply(&user, update, "paypal").await?;
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            subscription_id = %resource.id,
            user_id = %user.id,
            applied = outcome.applied,
            "PayPal subscription event processed"
        );
        Ok(())
    }

    /// A renewal payment carries no status change; it only owes the user a
    /// receipt, idempotent per billing period.
    async fn handle_sale_completed(&self, event: PayPalWebhookEvent) -> BillingResult<()> {
        let sale: PayPalSaleResource = serde_json::from_value(event.resource.clone())?;
        let Some(subscription_id) = sale.billing_agreement_id.as_deref() else {
            // One-off payment, not a subscription renewal.
            tracing::info!(sale_id = %sale.id, "Sale without billing agreement, ignoring");
            return Ok(());
        };

        let Some(user) = self
            .store
            .find_by_subscription_id(subscription_id, ReadScope::ActiveOnly)
            .await?
        else {
            return Err(BillingError::UserNotFound(format!(
                "no user for paypal subscription {subscription_id}"
            )));
        };

        // Key the receipt to this renewal's billing period; a constant key
        // would suppress every receipt after the first.
        let period = sale_period(&sale, user.subscription_ends_at);
        self.subscriptions
            .send_renewal_receipt(&user, subscription_id, period)
            .await;
        Ok(())
    }

    /// Resolve the affected user: subscription id first, then the clerk id
    /// we stamp into `custom_id` at checkout, then the subscriber email.
    async fn lookup_user(
        &self,
        resource: &PayPalSubscriptionResource,
    ) -> BillingResult<crate::store::UserRecord> {
        if let Some(user) = self
            .store
            .find_by_subscription_id(&resource.id, ReadScope::ActiveOnly)
            .await?
        {
            return Ok(user);
        }

        if let Some(clerk_id) = resource.custom_id.as_deref() {
            if let Some(user) = self
                .store
                .find_by_clerk_id(clerk_id, ReadScope::ActiveOnly)
                .await?
            {
                return Ok(user);
            }
        }

        if let Some(email) = resource.subscriber.email_address.as_deref() {
            if let Some(user) = self.store.find_by_email(email, ReadScope::ActiveOnly).await? {
                return Ok(user);
            }
        }

        Err(BillingError::UserNotFound(format!(
            "no user for paypal subscription {}",
            resource.id
        )))
    }
}
