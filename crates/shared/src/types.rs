//! Canonical subscription and feature types.
//!
//! Payment providers each speak their own status vocabulary; everything past
//! the webhook mapping layer uses these canonical types only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical subscription lifecycle status.
///
/// The legal transitions between these states are defined by
/// `studyforge_billing::lifecycle`; nothing should write a status to the
/// database without going through that validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Free,
    Trialing,
    Active,
    Cancelled,
    OnHold,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Free => "free",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::OnHold => "on_hold",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// All six canonical statuses, for exhaustive checks.
    pub fn all() -> [SubscriptionStatus; 6] {
        [
            SubscriptionStatus::Free,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::OnHold,
            SubscriptionStatus::Expired,
        ]
    }

    /// Whether the user currently has paid-tier access.
    pub fn has_paid_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
                | SubscriptionStatus::Cancelled
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when a raw status string is not one of the six canonical
/// statuses.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown subscription status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SubscriptionStatus::Free),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "on_hold" => Ok(SubscriptionStatus::OnHold),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Billing plan. Derived from the provider's billing interval, never taken
/// from client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Monthly,
    Yearly,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Monthly => "monthly",
            SubscriptionPlan::Yearly => "yearly",
        }
    }

    /// Map a provider billing interval ("month"/"year") to a plan.
    pub fn from_interval(interval: &str) -> Option<Self> {
        match interval {
            "month" | "monthly" => Some(SubscriptionPlan::Monthly),
            "year" | "yearly" | "annual" => Some(SubscriptionPlan::Yearly),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionPlan {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(SubscriptionPlan::Monthly),
            "yearly" => Ok(SubscriptionPlan::Yearly),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Study-material features with per-day usage limits.
///
/// Each variant carries its own column accessors and limits; feature dispatch
/// is an exhaustive match, never a string lookup into a generic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Flashcards,
    Quizzes,
    Summaries,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Flashcards => "flashcards",
            FeatureKind::Quizzes => "quizzes",
            FeatureKind::Summaries => "summaries",
        }
    }

    /// Daily generation cap for a given subscription status.
    pub fn daily_limit(&self, status: SubscriptionStatus) -> u32 {
        if status.has_paid_access() {
            match self {
                FeatureKind::Flashcards => 100,
                FeatureKind::Quizzes => 50,
                FeatureKind::Summaries => 50,
            }
        } else {
            match self {
                FeatureKind::Flashcards => 3,
                FeatureKind::Quizzes => 2,
                FeatureKind::Summaries => 2,
            }
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in SubscriptionStatus::all() {
            let parsed: SubscriptionStatus = status.as_str().parse().expect("canonical status");
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = "past_due".parse::<SubscriptionStatus>().unwrap_err();
        assert!(err.to_string().contains("past_due"));
    }

    #[test]
    fn plan_from_provider_intervals() {
        assert_eq!(
            SubscriptionPlan::from_interval("month"),
            Some(SubscriptionPlan::Monthly)
        );
        assert_eq!(
            SubscriptionPlan::from_interval("year"),
            Some(SubscriptionPlan::Yearly)
        );
        assert_eq!(SubscriptionPlan::from_interval("week"), None);
    }

    #[test]
    fn paid_access_covers_cancelled_grace_period() {
        // A cancelled subscription keeps access until subscription_ends_at.
        assert!(SubscriptionStatus::Cancelled.has_paid_access());
        assert!(!SubscriptionStatus::Expired.has_paid_access());
        assert!(!SubscriptionStatus::Free.has_paid_access());
    }

    #[test]
    fn free_tier_limits_are_lower() {
        for kind in [
            FeatureKind::Flashcards,
            FeatureKind::Quizzes,
            FeatureKind::Summaries,
        ] {
            assert!(
                kind.daily_limit(SubscriptionStatus::Free)
                    < kind.daily_limit(SubscriptionStatus::Active)
            );
        }
    }
}
