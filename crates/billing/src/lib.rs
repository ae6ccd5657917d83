// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Studyforge Billing Module
//!
//! Subscription lifecycle management for the Studyforge app: Stripe and
//! PayPal webhook processing, state transition validation, idempotent
//! transactional email, and the soft-deleting user store.
//!
//! ## Features
//!
//! - **Lifecycle Validation**: every status change is checked against the
//!   transition graph before it is persisted
//! - **Audit Trail**: valid and blocked transitions alike land in
//!   `subscription_audit_log`
//! - **Idempotent Email**: the `sent_emails` ledger guarantees at-most-once
//!   delivery per logical notification
//! - **Webhooks**: Stripe subscription events, PayPal billing events
//! - **Claim Verification**: client-submitted PayPal subscription ids are
//!   re-queried live before being honored

pub mod audit;
pub mod email;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod paypal;
pub mod store;
pub mod stripe;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::AuditLogger;

// Email
pub use email::BillingEmailService;

// Error
pub use error::{BillingError, BillingResult};

// Ledger
pub use ledger::{build_key, EmailLedger, EmailType};

// Lifecycle
pub use lifecycle::{validate_raw, validate_transition, TransitionCheck};

// PayPal
pub use paypal::{
    PayPalConfig, PayPalVerifier, PayPalWebhookEvent, PayPalWebhookProcessor,
    SubscriptionVerification,
};

// Store
pub use store::{DeleteMode, ReadScope, SubscriptionFields, UserRecord, UserStore};

// Stripe
pub use stripe::{StripeConfig, StripeEvent, StripeWebhookProcessor};

// Subscriptions
pub use subscriptions::{ApplyOutcome, SubscriptionService, SubscriptionUpdate};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: UserStore,
    pub audit: AuditLogger,
    pub ledger: EmailLedger,
    pub email: BillingEmailService,
    pub subscriptions: SubscriptionService,
    pub stripe: StripeWebhookProcessor,
    pub paypal: PayPalWebhookProcessor,
    pub paypal_config: PayPalConfig,
    pub verifier: PayPalVerifier,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> Self {
        let store = UserStore::new(pool.clone());
        let audit = AuditLogger::new(pool.clone());
        let ledger = EmailLedger::new(pool);
        let email = BillingEmailService::from_env();
        let subscriptions = SubscriptionService::new(
            store.clone(),
            audit.clone(),
            ledger.clone(),
            email.clone(),
        );
        let paypal_config = PayPalConfig::from_env();
        let verifier = PayPalVerifier::new(paypal_config.clone());

        Self {
            stripe: StripeWebhookProcessor::new(
                StripeConfig::from_env(),
                store.clone(),
                subscriptions.clone(),
            ),
            paypal: PayPalWebhookProcessor::new(
                paypal_config.clone(),
                store.clone(),
                subscriptions.clone(),
                verifier.clone(),
            ),
            verifier,
            paypal_config,
            store,
            audit,
            ledger,
            email,
            subscriptions,
        }
    }
}
