//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use studyforge_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = Arc::new(BillingService::from_env(pool.clone()));

        if billing.email.is_enabled() {
            tracing::info!("Billing email notifications enabled");
        } else {
            tracing::warn!("Billing email notifications not configured (missing RESEND_API_KEY)");
        }

        Self {
            pool,
            config,
            billing,
        }
    }
}
