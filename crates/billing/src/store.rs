//! Soft-delete-aware user store.
//!
//! "Delete" on a user is a flag flip, not a row removal: audit history and
//! idempotency fencing must survive account deletion, and a re-signup under
//! the same identity must not collide with the dead row. Reads scope to live
//! rows by default; callers opt in to deleted rows explicitly. This is a
//! deliberate, explicit wrapper around the `users` table rather than a
//! transparent rewrite of every query.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use studyforge_shared::{FeatureKind, SubscriptionPlan, SubscriptionStatus};

/// Read visibility. `ActiveOnly` is the default everywhere; `IncludeDeleted`
/// exists for admin and audit tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadScope {
    #[default]
    ActiveOnly,
    IncludeDeleted,
}

/// Delete behavior. `Soft` is the default for all application flows; `Hard`
/// physically removes the row and is reserved for privileged data-erasure
/// compliance requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    Soft,
    Hard,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub clerk_id: String,
    pub email: String,
    pub subscription_status: String,
    pub subscription_plan: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_ends_at: Option<OffsetDateTime>,
    pub trial_used_at: Option<OffsetDateTime>,
    pub is_deleted: bool,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserRecord {
    /// Parse the stored status. A non-canonical stored value surfaces as an
    /// error instead of being guessed at.
    pub fn status(&self) -> BillingResult<SubscriptionStatus> {
        self.subscription_status
            .parse()
            .map_err(|e: studyforge_shared::types::UnknownStatus| {
                BillingError::Internal(e.to_string())
            })
    }

    pub fn plan(&self) -> Option<SubscriptionPlan> {
        self.subscription_plan.as_deref().and_then(|p| p.parse().ok())
    }
}

/// Admit a primary-key lookup result under the requested scope. Primary-key
/// reads cannot have a filter injected, so a deleted row is discarded
/// post-hoc instead.
fn admit(record: UserRecord, scope: ReadScope) -> Option<UserRecord> {
    match scope {
        ReadScope::IncludeDeleted => Some(record),
        ReadScope::ActiveOnly if !record.is_deleted => Some(record),
        ReadScope::ActiveOnly => None,
    }
}

const USER_COLUMNS: &str = "id, clerk_id, email, subscription_status, subscription_plan, \
     subscription_id, customer_id, subscription_ends_at, trial_used_at, \
     is_deleted, deleted_at, created_at, updated_at";

/// Secondary-key lookup: the live-rows filter is injected here, so every
/// finder gets the scope behavior from one place.
fn find_sql(column: &str, scope: ReadScope) -> String {
    match scope {
        ReadScope::ActiveOnly => format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE {column} = $1 AND is_deleted = FALSE \
             ORDER BY created_at DESC LIMIT 1"
        ),
        ReadScope::IncludeDeleted => format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE {column} = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ),
    }
}

fn delete_sql(mode: DeleteMode) -> &'static str {
    match mode {
        // Guarded on is_deleted so a repeated delete reports zero rows
        // instead of refreshing deleted_at.
        DeleteMode::Soft => {
            "UPDATE users SET is_deleted = TRUE, deleted_at = NOW(), updated_at = NOW() \
             WHERE clerk_id = $1 AND is_deleted = FALSE"
        }
        DeleteMode::Hard => "DELETE FROM users WHERE clerk_id = $1",
    }
}

/// Create path of the identity upsert. The conflict target is the partial
/// unique index over live rows, so a soft-deleted row under the same clerk
/// id never conflicts: re-signup after deletion creates a fresh account.
fn identity_insert_sql() -> String {
    format!(
        "INSERT INTO users (clerk_id, email) VALUES ($1, $2) \
         ON CONFLICT (clerk_id) WHERE is_deleted = FALSE \
         DO UPDATE SET email = EXCLUDED.email, updated_at = NOW() \
         RETURNING {USER_COLUMNS}"
    )
}

/// Fields persisted by a subscription update. Everything is written in one
/// statement so a crash cannot leave status and plan disagreeing.
#[derive(Debug, Clone)]
pub struct SubscriptionFields {
    pub status: SubscriptionStatus,
    pub plan: Option<SubscriptionPlan>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub ends_at: Option<OffsetDateTime>,
    /// Set when this update begins a trial. `trial_used_at` is write-once:
    /// the store keeps any existing value regardless of what is passed here.
    pub trial_started_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid, scope: ReadScope) -> BillingResult<Option<UserRecord>> {
        let row: Option<UserRecord> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|r| admit(r, scope)))
    }

    pub async fn find_by_clerk_id(
        &self,
        clerk_id: &str,
        scope: ReadScope,
    ) -> BillingResult<Option<UserRecord>> {
        self.find_by_field("clerk_id", clerk_id, scope).await
    }

    pub async fn find_by_email(
        &self,
        email: &str,
        scope: ReadScope,
    ) -> BillingResult<Option<UserRecord>> {
        self.find_by_field("email", email, scope).await
    }

    pub async fn find_by_customer_id(
        &self,
        customer_id: &str,
        scope: ReadScope,
    ) -> BillingResult<Option<UserRecord>> {
        self.find_by_field("customer_id", customer_id, scope).await
    }

    pub async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
        scope: ReadScope,
    ) -> BillingResult<Option<UserRecord>> {
        self.find_by_field("subscription_id", subscription_id, scope)
            .await
    }

    async fn find_by_field(
        &self,
        column: &'static str,
        value: &str,
        scope: ReadScope,
    ) -> BillingResult<Option<UserRecord>> {
        let row = sqlx::query_as(&find_sql(column, scope))
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn count(&self, scope: ReadScope) -> BillingResult<i64> {
        let sql = match scope {
            ReadScope::ActiveOnly => "SELECT COUNT(*) FROM users WHERE is_deleted = FALSE",
            ReadScope::IncludeDeleted => "SELECT COUNT(*) FROM users",
        };
        let (count,): (i64,) = sqlx::query_as(sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Create-or-update keyed by the stable external identity, with an email
    /// fallback so an identity-provider environment switch (new clerk id,
    /// same person) re-links instead of duplicating. Soft-deleted rows are
    /// never resurrected: a deleted account behaves as "not found, create
    /// new".
    pub async fn upsert_by_identity(
        &self,
        clerk_id: &str,
        email: &str,
    ) -> BillingResult<UserRecord> {
        if let Some(user) = self.find_by_clerk_id(clerk_id, ReadScope::ActiveOnly).await? {
            if user.email != email {
                let updated: UserRecord = sqlx::query_as(&format!(
                    "UPDATE users SET email = $1, updated_at = NOW() \
                     WHERE id = $2 RETURNING {USER_COLUMNS}"
                ))
                .bind(email)
                .bind(user.id)
                .fetch_one(&self.pool)
                .await?;
                return Ok(updated);
            }
            return Ok(user);
        }

        if let Some(user) = self.find_by_email(email, ReadScope::ActiveOnly).await? {
            tracing::info!(
                user_id = %user.id,
                old_clerk_id = %user.clerk_id,
                new_clerk_id = %clerk_id,
                "Re-linking user by email (identity provider id changed)"
            );
            let updated: UserRecord = sqlx::query_as(&format!(
                "UPDATE users SET clerk_id = $1, updated_at = NOW() \
                 WHERE id = $2 RETURNING {USER_COLUMNS}"
            ))
            .bind(clerk_id)
            .bind(user.id)
            .fetch_one(&self.pool)
            .await?;
            return Ok(updated);
        }

        // Race-safe create: uniqueness is enforced only over live rows, so a
        // concurrent duplicate collapses into an update instead of an error.
        let created: UserRecord = sqlx::query_as(&identity_insert_sql())
            .bind(clerk_id)
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok(created)
    }

    /// Persist a validated subscription update. `trial_used_at` is guarded
    /// with COALESCE so it can never be overwritten once set.
    pub async fn apply_subscription_update(
        &self,
        user_id: Uuid,
        fields: &SubscriptionFields,
    ) -> BillingResult<UserRecord> {
        let updated: UserRecord = sqlx::query_as(&format!(
            "UPDATE users SET \
                subscription_status = $1, \
                subscription_plan = $2, \
                subscription_id = COALESCE($3, subscription_id), \
                customer_id = COALESCE($4, customer_id), \
                subscription_ends_at = $5, \
                trial_used_at = COALESCE(trial_used_at, $6), \
                updated_at = NOW() \
             WHERE id = $7 RETURNING {USER_COLUMNS}"
        ))
        .bind(fields.status.as_str())
        .bind(fields.plan.map(|p| p.as_str()))
        .bind(fields.subscription_id.as_deref())
        .bind(fields.customer_id.as_deref())
        .bind(fields.ends_at)
        .bind(fields.trial_started_at)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }

    /// Delete by clerk id. Soft by default; hard delete is the compliance
    /// escape hatch and removes the row for real. Returns whether a row was
    /// affected.
    pub async fn delete_by_clerk_id(
        &self,
        clerk_id: &str,
        mode: DeleteMode,
    ) -> BillingResult<bool> {
        let result = sqlx::query(delete_sql(mode))
            .bind(clerk_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record one use of a feature, resetting the counter on the first use of
    /// a new day. Returns the count after increment. Dispatch is an
    /// exhaustive match per feature; each variant owns its columns.
    pub async fn record_feature_use(
        &self,
        user_id: Uuid,
        kind: FeatureKind,
    ) -> BillingResult<i32> {
        let sql = match kind {
            FeatureKind::Flashcards => {
                "UPDATE users SET \
                    flashcards_used_today = CASE \
                        WHEN flashcards_last_used_on = CURRENT_DATE THEN flashcards_used_today + 1 \
                        ELSE 1 END, \
                    flashcards_last_used_on = CURRENT_DATE, updated_at = NOW() \
                 WHERE id = $1 AND is_deleted = FALSE \
                 RETURNING flashcards_used_today"
            }
            FeatureKind::Quizzes => {
                "UPDATE users SET \
                    quizzes_used_today = CASE \
                        WHEN quizzes_last_used_on = CURRENT_DATE THEN quizzes_used_today + 1 \
                        ELSE 1 END, \
                    quizzes_last_used_on = CURRENT_DATE, updated_at = NOW() \
                 WHERE id = $1 AND is_deleted = FALSE \
                 RETURNING quizzes_used_today"
            }
            FeatureKind::Summaries => {
                "UPDATE users SET \
                    summaries_used_today = CASE \
                        WHEN summaries_last_used_on = CURRENT_DATE THEN summaries_used_today + 1 \
                        ELSE 1 END, \
                    summaries_last_used_on = CURRENT_DATE, updated_at = NOW() \
                 WHERE id = $1 AND is_deleted = FALSE \
                 RETURNING summaries_used_today"
            }
        };

        let row: Option<(i32,)> = sqlx::query_as(sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(count,)| count)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }
}
