//! Billing error types.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("webhook payload malformed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("subscription verification failed: {0}")]
    VerificationFailed(String),

    #[error("email delivery failed: {0}")]
    EmailDelivery(String),

    #[error("provider request failed: {0}")]
    Provider(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::WebhookPayloadInvalid(e.to_string())
    }
}
