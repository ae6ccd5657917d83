//! Canonical subscription update path.
//!
//! Every provider notification, once mapped to canonical vocabulary, flows
//! through [`SubscriptionService::apply`]: transition validation + audit,
//! persistence, then idempotent side-effect emails. Webhook processors and
//! the claim endpoint share this path so the rules live in one place.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::email::BillingEmailService;
use crate::error::BillingResult;
use crate::ledger::{build_key, EmailLedger, EmailType};
use crate::lifecycle::validate_raw;
use crate::store::{SubscriptionFields, UserRecord, UserStore};
use studyforge_shared::{SubscriptionPlan, SubscriptionStatus};

/// A provider notification translated to canonical vocabulary.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub status: SubscriptionStatus,
    pub plan: Option<SubscriptionPlan>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    /// Meaning depends on `status`: trial end, paid-period end, or
    /// access-revocation date.
    pub ends_at: Option<OffsetDateTime>,
    /// Current billing period end, used to key renewal receipts.
    pub period_end: Option<OffsetDateTime>,
    /// Raw provider event name, recorded in the audit metadata.
    pub provider_event: String,
}

/// What `apply` did.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Whether the update was persisted (false means the transition was
    /// blocked and audit-logged; the account is unchanged).
    pub applied: bool,
    pub blocked_reason: Option<String>,
    pub plan_switch: bool,
    pub status: SubscriptionStatus,
}

/// A plan switch is an old plan and a new plan that are both present and
/// differ. Classified before overwriting, against the pre-update record,
/// because a downgrade-on-switch can transiently look like a cancellation.
pub(crate) fn detect_plan_switch(
    old: Option<SubscriptionPlan>,
    new: Option<SubscriptionPlan>,
) -> bool {
    matches!((old, new), (Some(o), Some(n)) if o != n)
}

/// Which side-effect emails a transition triggers. `from` is the status
/// persisted at the moment of processing, not whatever the event claims.
pub(crate) fn plan_side_effects(
    from: SubscriptionStatus,
    to: SubscriptionStatus,
    plan_switch: bool,
) -> Vec<EmailType> {
    match to {
        // Redeliveries of the trial event are harmless; the ledger dedups
        // on subscription id.
        SubscriptionStatus::Trialing => vec![EmailType::TrialWelcome],
        SubscriptionStatus::Active => {
            if plan_switch {
                vec![EmailType::PlanChange]
            } else {
                // Welcome dedups per subscription; the receipt is keyed per
                // billing period so renewals still get one.
                vec![EmailType::Welcome, EmailType::Receipt]
            }
        }
        SubscriptionStatus::Cancelled => {
            // An account still persisted as active when a cancel arrives is a
            // plan switch in progress (the old subscription being torn down),
            // not a true cancellation.
            if !plan_switch && from != SubscriptionStatus::Active {
                vec![EmailType::Cancellation]
            } else {
                vec![]
            }
        }
        SubscriptionStatus::Free | SubscriptionStatus::Expired | SubscriptionStatus::OnHold => {
            vec![]
        }
    }
}

fn date_or(ts: Option<OffsetDateTime>, fallback: &str) -> String {
    ts.map(|t| t.date().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: UserStore,
    audit: AuditLogger,
    ledger: EmailLedger,
    email: BillingEmailService,
}

impl SubscriptionService {
    pub fn new(
        store: UserStore,
        audit: AuditLogger,
        ledger: EmailLedger,
        email: BillingEmailService,
    ) -> Self {
        Self {
            store,
            audit,
            ledger,
            email,
        }
    }

    /// Apply a mapped provider notification to a user.
    ///
    /// A blocked transition is not an error: it is audit-logged, nothing is
    /// persisted, no email fires, and the caller still acknowledges the
    /// delivery (the provider must not retry something we declined).
    pub async fn apply(
        &self,
        user: &UserRecord,
        update: SubscriptionUpdate,
        source: &str,
    ) -> BillingResult<ApplyOutcome> {
        let from_raw = user.subscription_status.as_str();
        let old_plan = user.plan();
        let plan_switch = detect_plan_switch(old_plan, update.plan);

        let check = validate_raw(from_raw, update.status);
        let metadata = serde_json::json!({
            "event": update.provider_event,
            "old_plan": old_plan.map(|p| p.as_str()),
            "new_plan": update.plan.map(|p| p.as_str()),
            "plan_switch": plan_switch,
        });

        let valid = self
            .audit
            .record_transition(
                user.id,
                from_raw,
                update.status,
                update.subscription_id.as_deref(),
                source,
                Some(metadata),
            )
            .await;

        if !valid {
            return Ok(ApplyOutcome {
                applied: false,
                blocked_reason: check.reason,
                plan_switch,
                status: update.status,
            });
        }

        let trial_started = update.status == SubscriptionStatus::Trialing;
        let fields = SubscriptionFields {
            status: update.status,
            plan: update.plan,
            subscription_id: update.subscription_id.clone(),
            customer_id: update.customer_id.clone(),
            ends_at: update.ends_at,
            trial_started_at: trial_started.then(OffsetDateTime::now_utc),
        };
        let persisted = self.store.apply_subscription_update(user.id, &fields).await?;

        tracing::info!(
            user_id = %user.id,
            from = %from_raw,
            to = %update.status,
            plan = ?update.plan,
            plan_switch = plan_switch,
            source = %source,
            "Subscription status persisted"
        );

        // The transition was valid, so from_raw parsed; Free is an
        // unreachable fallback.
        let from_status = from_raw
            .parse::<SubscriptionStatus>()
            .unwrap_or(SubscriptionStatus::Free);
        let emails = plan_side_effects(from_status, update.status, plan_switch);
        self.dispatch_emails(&persisted, &update, old_plan, &emails)
            .await;

        Ok(ApplyOutcome {
            applied: true,
            blocked_reason: None,
            plan_switch,
            status: update.status,
        })
    }

    async fn dispatch_emails(
        &self,
        user: &UserRecord,
        update: &SubscriptionUpdate,
        old_plan: Option<SubscriptionPlan>,
        emails: &[EmailType],
    ) {
        let sub_id = update
            .subscription_id
            .as_deref()
            .or(user.subscription_id.as_deref())
            .unwrap_or("unknown")
            .to_string();
        let recipient = user.email.clone();

        for email_type in emails {
            match email_type {
                EmailType::TrialWelcome => {
                    let key = build_key(EmailType::TrialWelcome, &sub_id);
                    let svc = self.email.clone();
                    let to = recipient.clone();
                    let ends = date_or(update.ends_at, "the end of your trial");
                    self.ledger
                        .send_with_claim(&key, EmailType::TrialWelcome, &recipient, move || {
                            async move { svc.send_trial_welcome(&to, &ends).await }
                        })
                        .await;
                }
                EmailType::Welcome => {
                    let key = build_key(EmailType::Welcome, &sub_id);
                    let svc = self.email.clone();
                    let to = recipient.clone();
                    let plan = update.plan;
                    self.ledger
                        .send_with_claim(&key, EmailType::Welcome, &recipient, move || async move {
                            svc.send_subscription_welcome(&to, plan).await
                        })
                        .await;
                }
                EmailType::Receipt => {
                    // Keyed per billing period so every renewal produces one
                    // receipt, but redeliveries within a period do not.
                    let period = date_or(update.period_end.or(update.ends_at), "current");
                    let key = build_key(EmailType::Receipt, &format!("{sub_id}:{period}"));
                    let svc = self.email.clone();
                    let to = recipient.clone();
                    let plan = update.plan;
                    let period_end = period.clone();
                    self.ledger
                        .send_with_claim(&key, EmailType::Receipt, &recipient, move || async move {
                            svc.send_payment_receipt(&to, plan, &period_end).await
                        })
                        .await;
                }
                EmailType::PlanChange => {
                    let (Some(old), Some(new)) = (old_plan, update.plan) else {
                        continue;
                    };
                    let key =
                        build_key(EmailType::PlanChange, &format!("{sub_id}:{}", new.as_str()));
                    let svc = self.email.clone();
                    let to = recipient.clone();
                    self.ledger
                        .send_with_claim(&key, EmailType::PlanChange, &recipient, move || {
                            async move { svc.send_plan_changed(&to, old, new).await }
                        })
                        .await;
                }
                EmailType::Cancellation => {
                    let key = build_key(EmailType::Cancellation, &sub_id);
                    let svc = self.email.clone();
                    let to = recipient.clone();
                    let until = date_or(update.ends_at, "the end of your billing period");
                    self.ledger
                        .send_with_claim(&key, EmailType::Cancellation, &recipient, move || {
                            async move { svc.send_subscription_cancelled(&to, &until).await }
                        })
                        .await;
                }
                EmailType::AccountDeleted => {
                    // Dispatched from the identity-sync path, not here.
                }
            }
        }
    }

    /// Renewal receipt for a payment event that carries no status change
    /// (e.g. PayPal PAYMENT.SALE.COMPLETED). Idempotent per billing period;
    /// callers must pass a period that distinguishes consecutive renewals.
    /// Returns whether a send was attempted.
    pub async fn send_renewal_receipt(
        &self,
        user: &UserRecord,
        subscription_id: &str,
        period_end: Option<OffsetDateTime>,
    ) -> bool {
        let period = date_or(period_end, "current");
        let key = build_key(EmailType::Receipt, &format!("{subscription_id}:{period}"));
        let svc = self.email.clone();
        let to = user.email.clone();
        let plan = user.plan();
        let period_str = period.clone();
        self.ledger
            .send_with_claim(&key, EmailType::Receipt, &user.email, move || async move {
                svc.send_payment_receipt(&to, plan, &period_str).await
            })
            .await
    }

    /// Soft-delete side effect: account-deleted email, idempotent per clerk
    /// id so a redelivered identity webhook cannot double-send.
    pub async fn send_account_deleted(&self, user_id: Uuid, clerk_id: &str, email: &str) {
        let key = build_key(EmailType::AccountDeleted, clerk_id);
        let svc = self.email.clone();
        let to = email.to_string();
        let sent = self
            .ledger
            .send_with_claim(&key, EmailType::AccountDeleted, email, move || async move {
                svc.send_account_deleted(&to).await
            })
            .await;
        if sent {
            self.audit
                .record(
                    user_id,
                    crate::audit::ACTION_ACCOUNT_SOFT_DELETED,
                    Some(clerk_id),
                    None,
                    None,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studyforge_shared::SubscriptionStatus::*;

    #[test]
    fn plan_switch_requires_both_plans_present_and_different() {
        use SubscriptionPlan::*;
        assert!(detect_plan_switch(Some(Monthly), Some(Yearly)));
        assert!(detect_plan_switch(Some(Yearly), Some(Monthly)));
        assert!(!detect_plan_switch(Some(Monthly), Some(Monthly)));
        assert!(!detect_plan_switch(None, Some(Yearly)));
        assert!(!detect_plan_switch(Some(Monthly), None));
        assert!(!detect_plan_switch(None, None));
    }

    #[test]
    fn trial_entry_sends_trial_welcome() {
        assert_eq!(
            plan_side_effects(Free, Trialing, false),
            vec![EmailType::TrialWelcome]
        );
    }

    #[test]
    fn first_activation_sends_welcome_and_receipt() {
        assert_eq!(
            plan_side_effects(Free, Active, false),
            vec![EmailType::Welcome, EmailType::Receipt]
        );
        assert_eq!(
            plan_side_effects(Trialing, Active, false),
            vec![EmailType::Welcome, EmailType::Receipt]
        );
    }

    #[test]
    fn plan_switch_sends_only_plan_change() {
        // Active monthly -> active yearly: status self-loop, plan updates,
        // plan-change email only.
        assert_eq!(
            plan_side_effects(Active, Active, true),
            vec![EmailType::PlanChange]
        );
    }

    #[test]
    fn switch_in_progress_suppresses_cancellation_email() {
        // The raw event says cancelled, but the account is still persisted as
        // active: the old subscription of a switch being torn down.
        assert!(plan_side_effects(Active, Cancelled, false).is_empty());
        assert!(plan_side_effects(Trialing, Cancelled, true).is_empty());
    }

    #[test]
    fn genuine_cancellation_sends_cancellation_email() {
        assert_eq!(
            plan_side_effects(Trialing, Cancelled, false),
            vec![EmailType::Cancellation]
        );
        assert_eq!(
            plan_side_effects(OnHold, Cancelled, false),
            vec![EmailType::Cancellation]
        );
    }

    #[test]
    fn downgrades_and_holds_send_nothing() {
        assert!(plan_side_effects(Cancelled, Free, false).is_empty());
        assert!(plan_side_effects(Active, OnHold, false).is_empty());
        assert!(plan_side_effects(Active, Expired, false).is_empty());
    }

    fn service_with_memory_ledger() -> SubscriptionService {
        // The renewal-receipt path only touches the ledger and the email
        // service; a lazy pool connects on first use and is never reached.
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        SubscriptionService::new(
            UserStore::new(pool.clone()),
            AuditLogger::new(pool),
            EmailLedger::new_in_memory(),
            BillingEmailService::disabled_for_tests(),
        )
    }

    fn user() -> UserRecord {
        let now = OffsetDateTime::now_utc();
        UserRecord {
            id: Uuid::new_v4(),
            clerk_id: "user_abc".into(),
            email: "a@b.c".into(),
            subscription_status: "active".into(),
            subscription_plan: Some("monthly".into()),
            subscription_id: Some("sub_1".into()),
            customer_id: None,
            subscription_ends_at: None,
            trial_used_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn renewal_receipts_repeat_across_billing_periods() {
        use time::macros::datetime;

        let service = service_with_memory_ledger();
        let user = user();
        let september = Some(datetime!(2026-09-01 0:00 UTC));
        let october = Some(datetime!(2026-10-01 0:00 UTC));

        // First renewal of the period sends; a redelivery of it does not.
        assert!(service.send_renewal_receipt(&user, "sub_1", september).await);
        assert!(!service.send_renewal_receipt(&user, "sub_1", september).await);

        // The next period must get its own receipt.
        assert!(
            service.send_renewal_receipt(&user, "sub_1", october).await,
            "a new billing period must produce a fresh receipt"
        );
    }
}
