// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Subscription Lifecycle
//!
//! Tests critical boundary conditions and race conditions in:
//! - Transition validation (out-of-order and replayed webhooks)
//! - Trial-detection heuristics (billing-gap boundaries)
//! - Email idempotency (duplicate deliveries, renewal receipts)
//! - Plan-switch classification (cancel-then-activate sequences)

mod transition_tests {
    use crate::lifecycle::{validate_raw, validate_transition};
    use studyforge_shared::SubscriptionStatus::*;

    // =========================================================================
    // A cancellation webhook delivered after the subscription already expired
    // must not resurrect the account into cancelled-with-access.
    // =========================================================================
    #[test]
    fn stale_cancellation_after_expiry_is_blocked() {
        let check = validate_transition(Expired, Cancelled);
        assert!(!check.valid, "expired accounts cannot become cancelled");
        assert!(check.reason.is_some());
    }

    // =========================================================================
    // A replayed activation for an already-active subscription is a self-loop
    // and must pass (plan switches ride on exactly this).
    // =========================================================================
    #[test]
    fn replayed_activation_is_a_valid_self_loop() {
        assert!(validate_transition(Active, Active).valid);
        assert!(validate_transition(Trialing, Trialing).valid);
    }

    // =========================================================================
    // A free account receiving a bare cancellation (no prior activation seen,
    // e.g. webhooks arrived out of order) must be blocked, not downgraded
    // through a state it never held.
    // =========================================================================
    #[test]
    fn cancellation_of_a_free_account_is_blocked() {
        assert!(!validate_transition(Free, Cancelled).valid);
        assert!(!validate_transition(Free, Expired).valid);
        assert!(!validate_transition(Free, OnHold).valid);
    }

    // =========================================================================
    // A row carrying a status string this version does not know (e.g. from a
    // rolled-back deploy) must block every transition rather than panic or
    // guess.
    // =========================================================================
    #[test]
    fn unknown_persisted_status_blocks_all_transitions() {
        let check = validate_raw("super_premium", Active);
        assert!(!check.valid);
        assert!(check.reason.unwrap().contains("super_premium"));
    }

    // =========================================================================
    // Recovery paths: expired and cancelled accounts must be able to come
    // back without manual intervention.
    // =========================================================================
    #[test]
    fn lapsed_accounts_can_resubscribe() {
        assert!(validate_transition(Expired, Active).valid);
        assert!(validate_transition(Expired, Trialing).valid);
        assert!(validate_transition(Cancelled, Active).valid);
        assert!(validate_transition(OnHold, Active).valid);
    }
}

mod trial_heuristic_tests {
    use crate::stripe::{map_subscription, StripeItem, StripeItemList, StripePrice, StripeRecurring, StripeSubscription};
    use studyforge_shared::SubscriptionStatus::*;

    const DAY: i64 = 86_400;
    const START: i64 = 1_700_000_000;

    fn first_cycle(days: i64) -> StripeSubscription {
        StripeSubscription {
            id: "sub_edge".into(),
            customer: Some("cus_edge".into()),
            status: Some("active".into()),
            cancel_at_period_end: false,
            start_date: Some(START),
            current_period_start: Some(START),
            current_period_end: Some(START + days * DAY),
            trial_end: None,
            items: StripeItemList {
                data: vec![StripeItem {
                    price: Some(StripePrice {
                        id: "price_edge".into(),
                        recurring: Some(StripeRecurring {
                            interval: Some("month".into()),
                        }),
                    }),
                }],
            },
            metadata: Default::default(),
        }
    }

    // =========================================================================
    // The trial window is inclusive at 15 days: 15 -> trial, 16 -> paid.
    // February (28-day months) must still land on the paid side.
    // =========================================================================
    #[test]
    fn billing_gap_boundary() {
        let cases = [(7, Trialing), (14, Trialing), (15, Trialing), (16, Active), (28, Active), (31, Active)];
        for (days, expected) in cases {
            let update =
                map_subscription("customer.subscription.created", &first_cycle(days));
            assert_eq!(update.status, expected, "{days}-day first cycle");
        }
    }

    // =========================================================================
    // A provider-declared trial wins regardless of the gap arithmetic.
    // =========================================================================
    #[test]
    fn declared_trial_beats_the_heuristic() {
        let mut sub = first_cycle(31);
        sub.status = Some("trialing".into());
        let update = map_subscription("customer.subscription.updated", &sub);
        assert_eq!(update.status, Trialing);
    }
}

mod email_idempotency_tests {
    use crate::ledger::{build_key, EmailLedger, EmailType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // =========================================================================
    // Stripe redelivers the same event id on timeout; both deliveries compute
    // the same key, so the second one must find the ledger row and skip.
    // =========================================================================
    #[tokio::test]
    async fn redelivered_webhook_sends_one_welcome() {
        let ledger = EmailLedger::new_in_memory();
        let key = build_key(EmailType::Welcome, "sub_redelivered");
        let sends = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let sends = Arc::clone(&sends);
            ledger
                .send_with_claim(&key, EmailType::Welcome, "a@b.c", move || async move {
                    sends.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }

        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Renewal receipts are keyed per billing period: a new period means a new
    // key and therefore a new receipt, while redeliveries within one period
    // collapse.
    // =========================================================================
    #[tokio::test]
    async fn each_billing_period_gets_its_own_receipt() {
        let ledger = EmailLedger::new_in_memory();
        let september = build_key(EmailType::Receipt, "sub_1:2026-09-01");
        let october = build_key(EmailType::Receipt, "sub_1:2026-10-01");

        assert!(ledger.try_claim(&september, EmailType::Receipt, "a@b.c").await);
        assert!(!ledger.try_claim(&september, EmailType::Receipt, "a@b.c").await);
        assert!(ledger.try_claim(&october, EmailType::Receipt, "a@b.c").await);
    }

    // =========================================================================
    // Different notification types for the same subscription never collide.
    // =========================================================================
    #[tokio::test]
    async fn notification_types_do_not_share_keys() {
        let ledger = EmailLedger::new_in_memory();
        for email_type in [
            EmailType::TrialWelcome,
            EmailType::Welcome,
            EmailType::Cancellation,
        ] {
            let key = build_key(email_type, "sub_same");
            assert!(ledger.try_claim(&key, email_type, "a@b.c").await);
        }
    }
}

mod plan_switch_tests {
    use crate::subscriptions::{detect_plan_switch, plan_side_effects};
    use crate::ledger::EmailType;
    use studyforge_shared::SubscriptionPlan::*;
    use studyforge_shared::SubscriptionStatus::*;

    // =========================================================================
    // Monthly -> yearly arrives as two webhooks: a cancellation for the old
    // subscription while the account is still active, then an activation with
    // the new plan. The user must see exactly one plan-change email and no
    // cancellation email.
    // =========================================================================
    #[test]
    fn switch_sequence_produces_only_a_plan_change_email() {
        // Step 1: cancel event, account still persisted as active.
        assert!(plan_side_effects(Active, Cancelled, false).is_empty());

        // Step 2: activation with the new plan.
        assert!(detect_plan_switch(Some(Monthly), Some(Yearly)));
        assert_eq!(
            plan_side_effects(Active, Active, true),
            vec![EmailType::PlanChange]
        );
    }

    // =========================================================================
    // A user who genuinely cancels from a non-active state (trial, hold)
    // still gets the goodbye email.
    // =========================================================================
    #[test]
    fn genuine_cancellation_is_not_mistaken_for_a_switch() {
        assert_eq!(
            plan_side_effects(Trialing, Cancelled, false),
            vec![EmailType::Cancellation]
        );
        assert_eq!(
            plan_side_effects(OnHold, Cancelled, false),
            vec![EmailType::Cancellation]
        );
    }

    // =========================================================================
    // An event repeating the current plan is not a switch, even when a plan
    // id is present on both sides.
    // =========================================================================
    #[test]
    fn same_plan_redelivery_is_not_a_switch() {
        assert!(!detect_plan_switch(Some(Yearly), Some(Yearly)));
        assert!(!detect_plan_switch(None, Some(Yearly)));
    }
}
