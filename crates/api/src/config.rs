//! Server configuration loaded from environment variables.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Svix-style signing secret for the identity webhook. Optional so
    /// local development works; without it identity events are rejected.
    pub clerk_webhook_secret: Option<String>,
    /// Comma-separated CORS origin allowlist.
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let clerk_webhook_secret = std::env::var("CLERK_WEBHOOK_SECRET")
            .ok()
            .filter(|v| !v.is_empty());
        if clerk_webhook_secret.is_none() {
            tracing::warn!(
                "CLERK_WEBHOOK_SECRET not set - identity webhooks will be rejected"
            );
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address,
            clerk_webhook_secret,
            allowed_origins,
        })
    }
}
