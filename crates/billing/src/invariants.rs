//! Billing invariants.
//!
//! Runnable consistency checks for the reconciliation core. Each check is a
//! real SQL query that only reads; violations carry enough context to debug.
//! The worker runs the full set nightly, and the set can be run after any
//! webhook replay to confirm the system converged to a valid state.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or access is wrong right now.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Should investigate.
    Medium,
    /// Informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of one full sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleAuthoritativeRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateReferenceRow {
    provider: String,
    reference: String,
    payment_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ProcessedWithoutTimestampRow {
    event_id: String,
    provider: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnloggedLapsedTrialRow {
    subscription_id: Uuid,
    user_id: Uuid,
    trial_ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleRenewalRow {
    subscription_id: Uuid,
    user_id: Uuid,
    renewal_date: OffsetDateTime,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_authoritative_subscription().await?);
        violations.extend(self.check_payment_reference_unique().await?);
        violations.extend(self.check_processed_events_have_timestamp().await?);
        violations.extend(self.check_lapsed_trials_logged().await?);
        violations.extend(self.check_active_renewal_in_future().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one authoritative subscription row per user.
    ///
    /// Entitlement picks the most recent active/trialing row; more than one
    /// means some path inserted instead of renewing, and the user may be
    /// double-billed.
    async fn check_single_authoritative_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleAuthoritativeRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_authoritative_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active/trialing subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: `(provider, reference)` never maps to more than one
    /// payment row.
    ///
    /// The unique index should make this impossible; a violation means the
    /// index was dropped or bypassed and the business-effect idempotence
    /// boundary is gone.
    async fn check_payment_reference_unique(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateReferenceRow> = sqlx::query_as(
            r#"
            SELECT provider, reference, COUNT(*) as payment_count
            FROM payments
            GROUP BY provider, reference
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payment_reference_unique".to_string(),
                user_ids: vec![],
                description: format!(
                    "Reference '{}' on {} has {} payment rows",
                    row.reference, row.provider, row.payment_count
                ),
                context: serde_json::json!({
                    "provider": row.provider,
                    "reference": row.reference,
                    "payment_count": row.payment_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: terminal events carry a processed_at timestamp.
    async fn check_processed_events_have_timestamp(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ProcessedWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT event_id, provider
            FROM webhook_events
            WHERE status IN ('processed', 'failed')
              AND processed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "processed_events_have_timestamp".to_string(),
                user_ids: vec![],
                description: format!(
                    "Event '{}' from {} is terminal but has no processed_at",
                    row.event_id, row.provider
                ),
                context: serde_json::json!({
                    "event_id": row.event_id,
                    "provider": row.provider,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: a trial that lapsed more than a day ago has its
    /// trial_expired audit entry.
    ///
    /// The entry is written lazily on the first entitlement resolution after
    /// the lapse, so a short window without one is normal; a day-old gap
    /// means nobody resolved the user at all or the log-if-absent is broken.
    async fn check_lapsed_trials_logged(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnloggedLapsedTrialRow> = sqlx::query_as(
            r#"
            SELECT s.id as subscription_id, s.user_id, s.trial_ends_at
            FROM subscriptions s
            WHERE s.status = 'trialing'
              AND s.trial_ends_at < NOW() - INTERVAL '1 day'
              AND NOT EXISTS (
                  SELECT 1 FROM billing_events b
                  WHERE b.user_id = s.user_id
                    AND b.event_type = 'trial_expired'
                    AND b.reference = s.id::TEXT
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "lapsed_trials_logged".to_string(),
                user_ids: vec![row.user_id],
                description: "Trial lapsed over a day ago with no trial_expired audit entry"
                    .to_string(),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "trial_ends_at": row.trial_ends_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 5: active subscriptions renew in the future (with a 2-day
    /// grace window for in-flight renewals).
    async fn check_active_renewal_in_future(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleRenewalRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, user_id, renewal_date
            FROM subscriptions
            WHERE status = 'active'
              AND renewal_date < NOW() - INTERVAL '2 days'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_renewal_in_future".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription renewal date {} is in the past",
                    row.renewal_date
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "renewal_date": row.renewal_date.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run one invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_authoritative_subscription" => {
                self.check_single_authoritative_subscription().await
            }
            "payment_reference_unique" => self.check_payment_reference_unique().await,
            "processed_events_have_timestamp" => {
                self.check_processed_events_have_timestamp().await
            }
            "lapsed_trials_logged" => self.check_lapsed_trials_logged().await,
            "active_renewal_in_future" => self.check_active_renewal_in_future().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_authoritative_subscription",
            "payment_reference_unique",
            "processed_events_have_timestamp",
            "lapsed_trials_logged",
            "active_renewal_in_future",
        ]
    }
}
