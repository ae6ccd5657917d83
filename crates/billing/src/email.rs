//! Transactional billing email delivery via the Resend HTTP API.
//!
//! This service only renders and posts. Whether a given email may be sent at
//! all is decided upstream by the idempotency ledger.

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use studyforge_shared::SubscriptionPlan;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Clone)]
pub struct BillingEmailService {
    client: reqwest::Client,
    api_key: Option<String>,
    from_address: String,
    api_url: String,
}

impl BillingEmailService {
    /// Build from `RESEND_API_KEY` / `EMAIL_FROM`. Without an API key the
    /// service stays constructed but disabled; sends are logged and skipped.
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty());
        let from_address = std::env::var("EMAIL_FROM")
            .unwrap_or_else(|_| "Studyforge <billing@studyforge.app>".to_string());

        Self {
            client: reqwest::Client::new(),
            api_key,
            from_address,
            api_url: RESEND_API_URL.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    #[cfg(test)]
    pub fn disabled_for_tests() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            from_address: "Studyforge <billing@studyforge.app>".to_string(),
            api_url: RESEND_API_URL.to_string(),
        }
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(api_key) = &self.api_key else {
            tracing::info!(
                to = %to,
                subject = %subject,
                "Email delivery disabled (RESEND_API_KEY not set), skipping send"
            );
            return Ok(());
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&SendRequest {
                from: &self.from_address,
                to: [to],
                subject,
                html,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::EmailDelivery(format!(
                "resend returned {status}: {body}"
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Email sent");
        Ok(())
    }

    pub async fn send_trial_welcome(&self, to: &str, trial_ends: &str) -> BillingResult<()> {
        let html = format!(
            "<h2>Your Studyforge trial has started</h2>\
             <p>You now have full access to AI flashcards, quizzes and summaries.</p>\
             <p>Your trial ends on <strong>{trial_ends}</strong>.</p>"
        );
        self.send(to, "Your Studyforge trial has started", &html).await
    }

    pub async fn send_subscription_welcome(
        &self,
        to: &str,
        plan: Option<SubscriptionPlan>,
    ) -> BillingResult<()> {
        let plan_name = plan.map(|p| p.as_str()).unwrap_or("premium");
        let html = format!(
            "<h2>Welcome to Studyforge Premium</h2>\
             <p>Your {plan_name} subscription is now active. Happy studying!</p>"
        );
        self.send(to, "Welcome to Studyforge Premium", &html).await
    }

    pub async fn send_payment_receipt(
        &self,
        to: &str,
        plan: Option<SubscriptionPlan>,
        period_end: &str,
    ) -> BillingResult<()> {
        let plan_name = plan.map(|p| p.as_str()).unwrap_or("premium");
        let html = format!(
            "<h2>Payment received</h2>\
             <p>Thanks for your payment. Your {plan_name} subscription is paid \
             through <strong>{period_end}</strong>.</p>"
        );
        self.send(to, "Your Studyforge receipt", &html).await
    }

    pub async fn send_plan_changed(
        &self,
        to: &str,
        old_plan: SubscriptionPlan,
        new_plan: SubscriptionPlan,
    ) -> BillingResult<()> {
        let html = format!(
            "<h2>Your plan has changed</h2>\
             <p>Your Studyforge subscription switched from <strong>{old_plan}</strong> \
             to <strong>{new_plan}</strong>. The change takes effect with your current \
             billing period.</p>"
        );
        self.send(to, "Your Studyforge plan has changed", &html).await
    }

    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        access_until: &str,
    ) -> BillingResult<()> {
        let html = format!(
            "<h2>Subscription cancelled</h2>\
             <p>Sorry to see you go. You keep full access until \
             <strong>{access_until}</strong>, after which your account returns to \
             the free tier.</p>"
        );
        self.send(to, "Your Studyforge subscription was cancelled", &html)
            .await
    }

    pub async fn send_account_deleted(&self, to: &str) -> BillingResult<()> {
        let html = "<h2>Account deleted</h2>\
                    <p>Your Studyforge account has been deleted. If this wasn't you, \
                    reply to this email.</p>"
            .to_string();
        self.send(to, "Your Studyforge account was deleted", &html)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_service_skips_without_error() {
        let service = BillingEmailService::disabled_for_tests();
        assert!(!service.is_enabled());
        // No API key: sends are no-ops, never errors.
        service
            .send_account_deleted("someone@example.com")
            .await
            .unwrap();
    }
}
