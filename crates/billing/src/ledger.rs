//! Idempotency ledger for transactional email.
//!
//! Each logical notification ("trial welcome for subscription X") must send
//! at most one email, even when the provider delivers the same webhook twice
//! or two deliveries race. The ledger reduces that to a single atomic
//! create-if-absent insert: exactly one caller creates the `sent_emails` row
//! and wins the right to send; everyone else observes the pre-existing row
//! and skips. No locks, no external coordination.
//!
//! Failure policy: if the ledger itself cannot be reached, the check fails
//! open (the send is permitted). One duplicate email is cheaper than
//! silently dropping every subscription notification during a store hiccup.

use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// Logical email categories. The variant name is the key prefix, so it must
/// stay stable once rows exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmailType {
    TrialWelcome,
    Welcome,
    Receipt,
    PlanChange,
    Cancellation,
    AccountDeleted,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::TrialWelcome => "trial_welcome",
            EmailType::Welcome => "welcome",
            EmailType::Receipt => "receipt",
            EmailType::PlanChange => "plan_change",
            EmailType::Cancellation => "cancellation",
            EmailType::AccountDeleted => "account_deleted",
        }
    }
}

impl fmt::Display for EmailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic idempotency key for one logical send. Equal inputs always
/// produce equal keys regardless of which code path computes them.
pub fn build_key(email_type: EmailType, unique_id: &str) -> String {
    format!("{}:{}", email_type.as_str(), unique_id)
}

/// Result of one claim attempt against the backing store.
#[derive(Debug, Clone, Copy)]
struct ClaimOutcome {
    /// Whether this call created the row (and therefore won the claim).
    created: bool,
    created_at: OffsetDateTime,
}

#[derive(Clone)]
enum LedgerBackend {
    Postgres(PgPool),
    /// In-memory backend for tests; same claim semantics without a database.
    Memory(Arc<Mutex<HashMap<String, OffsetDateTime>>>),
}

/// At-most-once send fence over the `sent_emails` table.
#[derive(Clone)]
pub struct EmailLedger {
    backend: LedgerBackend,
    fail_open: bool,
}

impl EmailLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: LedgerBackend::Postgres(pool),
            fail_open: true,
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: LedgerBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
            fail_open: true,
        }
    }

    /// Override the fail-open policy. Defaults to `true`; flipping this
    /// changes observable behavior (sends get skipped during store outages).
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    async fn claim(
        &self,
        key: &str,
        email_type: EmailType,
        recipient: &str,
    ) -> BillingResult<ClaimOutcome> {
        match &self.backend {
            LedgerBackend::Postgres(pool) => {
                // Single atomic create-if-absent: the insert's own uniqueness
                // guarantee picks exactly one winner under concurrency.
                let inserted: Option<(OffsetDateTime,)> = sqlx::query_as(
                    r#"
                    INSERT INTO sent_emails (id, idempotency_key, email_type, recipient)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (idempotency_key) DO NOTHING
                    RETURNING created_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(key)
                .bind(email_type.as_str())
                .bind(recipient)
                .fetch_optional(pool)
                .await?;

                if let Some((created_at,)) = inserted {
                    return Ok(ClaimOutcome {
                        created: true,
                        created_at,
                    });
                }

                // Lost the race or a prior delivery already sent this one;
                // read the existing row for its age.
                let existing: Option<(OffsetDateTime,)> =
                    sqlx::query_as("SELECT created_at FROM sent_emails WHERE idempotency_key = $1")
                        .bind(key)
                        .fetch_optional(pool)
                        .await?;

                Ok(ClaimOutcome {
                    created: false,
                    created_at: existing
                        .map(|(t,)| t)
                        .unwrap_or_else(OffsetDateTime::now_utc),
                })
            }
            LedgerBackend::Memory(map) => {
                let mut map = map.lock().await;
                match map.get(key) {
                    Some(created_at) => Ok(ClaimOutcome {
                        created: false,
                        created_at: *created_at,
                    }),
                    None => {
                        let now = OffsetDateTime::now_utc();
                        map.insert(key.to_string(), now);
                        Ok(ClaimOutcome {
                            created: true,
                            created_at: now,
                        })
                    }
                }
            }
        }
    }

    /// Atomically claim `key`. Returns `true` only to the caller that created
    /// the ledger row; any pre-existing row means some other occurrence
    /// already sent (or is about to send) this email.
    pub async fn try_claim(&self, key: &str, email_type: EmailType, recipient: &str) -> bool {
        match self.claim(key, email_type, recipient).await {
            Ok(outcome) if outcome.created => {
                tracing::info!(key = %key, email_type = %email_type, "Claimed email send");
                true
            }
            Ok(outcome) => {
                // A row created within the last second is a concurrent
                // duplicate; anything materially older is a provider redelivery.
                let age = OffsetDateTime::now_utc() - outcome.created_at;
                tracing::info!(
                    key = %key,
                    email_type = %email_type,
                    prior_claim_age_secs = age.whole_seconds(),
                    "Skipping duplicate email send (already claimed)"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    email_type = %email_type,
                    error = %e,
                    fail_open = self.fail_open,
                    "Idempotency ledger unavailable"
                );
                self.fail_open
            }
        }
    }

    /// Claim `key` and, only on success, invoke the caller-supplied send.
    /// Returns whether a send was attempted. A send that itself fails is
    /// logged but still counts as attempted; the claim is not released (the
    /// fence guarantees at-most-once, not exactly-once).
    pub async fn send_with_claim<F, Fut>(
        &self,
        key: &str,
        email_type: EmailType,
        recipient: &str,
        send_fn: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BillingResult<()>>,
    {
        if !self.try_claim(key, email_type, recipient).await {
            return false;
        }

        if let Err(e) = send_fn().await {
            tracing::error!(
                key = %key,
                email_type = %email_type,
                recipient = %recipient,
                error = %e,
                "Email send failed after claim"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    #[test]
    fn key_is_deterministic_and_distinct() {
        assert_eq!(
            build_key(EmailType::TrialWelcome, "sub_123"),
            build_key(EmailType::TrialWelcome, "sub_123")
        );
        assert_ne!(
            build_key(EmailType::TrialWelcome, "sub_123"),
            build_key(EmailType::Welcome, "sub_123")
        );
        assert_ne!(
            build_key(EmailType::Cancellation, "sub_123"),
            build_key(EmailType::Cancellation, "sub_456")
        );
        assert_eq!(
            build_key(EmailType::Cancellation, "sub_123"),
            "cancellation:sub_123"
        );
    }

    #[tokio::test]
    async fn second_claim_loses() {
        let ledger = EmailLedger::new_in_memory();
        let key = build_key(EmailType::Welcome, "sub_1");

        assert!(ledger.try_claim(&key, EmailType::Welcome, "a@b.c").await);
        assert!(!ledger.try_claim(&key, EmailType::Welcome, "a@b.c").await);
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let ledger = EmailLedger::new_in_memory();
        assert!(
            ledger
                .try_claim("welcome:sub_1", EmailType::Welcome, "a@b.c")
                .await
        );
        assert!(
            ledger
                .try_claim("welcome:sub_2", EmailType::Welcome, "a@b.c")
                .await
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let ledger = Arc::new(EmailLedger::new_in_memory());
        let key = build_key(EmailType::Cancellation, "sub_123");
        let barrier = Arc::new(Barrier::new(16));

        let mut handles = vec![];
        for _ in 0..16 {
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .try_claim(&key, EmailType::Cancellation, "a@b.c")
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent claim must win");
    }

    #[tokio::test]
    async fn send_fn_runs_at_most_once() {
        let ledger = EmailLedger::new_in_memory();
        let key = build_key(EmailType::Receipt, "sub_9:2026-09-01");
        let sends = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let sends = Arc::clone(&sends);
            ledger
                .send_with_claim(&key, EmailType::Receipt, "a@b.c", move || async move {
                    sends.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }

        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_send_does_not_release_the_claim() {
        let ledger = EmailLedger::new_in_memory();
        let key = build_key(EmailType::Welcome, "sub_7");

        let attempted = ledger
            .send_with_claim(&key, EmailType::Welcome, "a@b.c", || async {
                Err(crate::error::BillingError::EmailDelivery(
                    "transport down".into(),
                ))
            })
            .await;
        assert!(attempted, "first call attempts the send");

        // The key stays burned even though the send failed: at-most-once.
        let attempted_again = ledger
            .send_with_claim(&key, EmailType::Welcome, "a@b.c", || async { Ok(()) })
            .await;
        assert!(!attempted_again);
    }
}
