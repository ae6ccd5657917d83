//! Append-only audit trail for subscription-affecting actions.
//!
//! Every attempted transition is recorded, allowed or blocked, so rejected
//! (stale, duplicated or fraudulent-looking) updates leave a forensic trail.
//! Audit writes are a secondary concern: storage failures are logged and
//! swallowed, never propagated to the caller.

use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::lifecycle::{validate_raw, TransitionCheck};
use studyforge_shared::SubscriptionStatus;

pub const ACTION_STATE_CHANGE: &str = "subscription_state_change";
pub const ACTION_STATE_CHANGE_BLOCKED: &str = "subscription_state_change_blocked";
pub const ACTION_ACCOUNT_SOFT_DELETED: &str = "account_soft_deleted";

#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one audit entry. Never raises: a failed insert is logged at
    /// error level and the triggering operation continues.
    pub async fn record(
        &self,
        user_id: Uuid,
        action: &str,
        resource_id: Option<&str>,
        details: Option<serde_json::Value>,
        source_ip: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO subscription_audit_log (user_id, action, resource_id, details, source_ip)
            VALUES ($1, $2, $3, COALESCE($4, '{}'::jsonb), $5)
            "#,
        )
        .bind(user_id)
        .bind(action)
        .bind(resource_id)
        .bind(details)
        .bind(source_ip)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                user_id = %user_id,
                action = %action,
                error = %e,
                "Failed to write audit log entry"
            );
        }
    }

    /// Validate a proposed transition, record the outcome (one entry whether
    /// allowed or blocked) and return the validity so the caller can decide
    /// whether to persist.
    ///
    /// `from_raw` is the status as currently stored; a non-canonical stored
    /// value is itself a blocked transition with a descriptive reason.
    pub async fn record_transition(
        &self,
        user_id: Uuid,
        from_raw: &str,
        to: SubscriptionStatus,
        subscription_id: Option<&str>,
        source: &str,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let check = validate_raw(from_raw, to);
        let (action, details) = transition_entry(from_raw, to, source, &check, metadata);

        if !check.valid {
            tracing::warn!(
                user_id = %user_id,
                from = %from_raw,
                to = %to,
                source = %source,
                reason = check.reason.as_deref().unwrap_or(""),
                "Blocked subscription state transition"
            );
        }

        self.record(user_id, action, subscription_id, Some(details), None)
            .await;

        check.valid
    }
}

/// Build the audit action name and serialized details for a transition
/// attempt. Split out of `record_transition` so the shape is testable without
/// a database.
fn transition_entry(
    from_raw: &str,
    to: SubscriptionStatus,
    source: &str,
    check: &TransitionCheck,
    metadata: Option<serde_json::Value>,
) -> (&'static str, serde_json::Value) {
    let action = if check.valid {
        ACTION_STATE_CHANGE
    } else {
        ACTION_STATE_CHANGE_BLOCKED
    };

    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string());

    let details = serde_json::json!({
        "from": from_raw,
        "to": to.as_str(),
        "source": source,
        "valid": check.valid,
        "reason": check.reason,
        "metadata": metadata,
        "timestamp": timestamp,
    });

    (action, details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::validate_raw;
    use studyforge_shared::SubscriptionStatus::*;

    #[test]
    fn allowed_transition_uses_change_action() {
        let check = validate_raw("free", Trialing);
        let (action, details) = transition_entry("free", Trialing, "stripe", &check, None);
        assert_eq!(action, ACTION_STATE_CHANGE);
        assert_eq!(details["from"], "free");
        assert_eq!(details["to"], "trialing");
        assert_eq!(details["valid"], true);
        assert!(details["reason"].is_null());
        assert_eq!(details["source"], "stripe");
    }

    #[test]
    fn blocked_transition_uses_blocked_action_and_carries_reason() {
        let check = validate_raw("expired", Cancelled);
        let (action, details) = transition_entry("expired", Cancelled, "stripe", &check, None);
        assert_eq!(action, ACTION_STATE_CHANGE_BLOCKED);
        assert_eq!(details["valid"], false);
        assert!(details["reason"].as_str().unwrap().contains("expired"));
    }

    #[test]
    fn metadata_is_passed_through() {
        let check = validate_raw("active", Cancelled);
        let meta = serde_json::json!({"event": "customer.subscription.updated"});
        let (_, details) = transition_entry("active", Cancelled, "stripe", &check, Some(meta));
        assert_eq!(
            details["metadata"]["event"],
            "customer.subscription.updated"
        );
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let check = validate_raw("free", Active);
        let (_, details) = transition_entry("free", Active, "paypal", &check, None);
        let ts = details["timestamp"].as_str().unwrap();
        assert!(ts.contains('T'), "expected RFC 3339 timestamp, got {ts}");
    }
}
