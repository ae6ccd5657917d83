//! Route registration.

mod subscription;
mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/webhooks/paypal", post(webhooks::paypal_webhook))
        .route("/webhooks/clerk", post(webhooks::clerk_webhook))
        .route("/api/subscription/claim", post(subscription::claim))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
