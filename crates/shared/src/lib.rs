#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared domain types and database plumbing for Studyforge services.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{FeatureKind, SubscriptionPlan, SubscriptionStatus};
