//! Usage metering and quota enforcement.
//!
//! Monthly usage is always a live aggregate over the domain rows themselves
//! (automation runs, invoices, AI usage entries) counted from the start of
//! the current UTC calendar month. There is no separately maintained counter
//! to drift out of sync; we pay a count query per check instead.
//!
//! Flow-count limiting is different: it guards a creation, so the count and
//! the insert run under the same per-user advisory lock the reconciler uses,
//! closing the check-then-act race between concurrent create requests.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use time::{OffsetDateTime, Time};
use uuid::Uuid;

use flowline_shared::PlanTier;

use crate::email::BillingEmailService;
use crate::entitlements::{Entitlement, EntitlementService};
use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::reconciler::acquire_user_lock;

/// Monthly-metered usage categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageCategory {
    AutomationRuns,
    Invoices,
    AiMessages,
}

impl UsageCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageCategory::AutomationRuns => "automation_runs",
            UsageCategory::Invoices => "invoices",
            UsageCategory::AiMessages => "ai_messages",
        }
    }

    /// Is this category usable during a trial?
    pub fn allows_trial(self) -> bool {
        match self {
            UsageCategory::AutomationRuns | UsageCategory::Invoices => true,
            // AI is never unlocked by a trial.
            UsageCategory::AiMessages => false,
        }
    }
}

impl FromStr for UsageCategory {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automation_runs" => Ok(UsageCategory::AutomationRuns),
            "invoices" => Ok(UsageCategory::Invoices),
            "ai_messages" => Ok(UsageCategory::AiMessages),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for UsageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monthly quota for a tier, `None` = unlimited.
pub fn quota(tier: PlanTier, category: UsageCategory) -> Option<i64> {
    match (tier, category) {
        (PlanTier::Free, UsageCategory::AutomationRuns) => Some(0),
        (PlanTier::Starter, UsageCategory::AutomationRuns) => Some(1_000),
        (PlanTier::Growth, UsageCategory::AutomationRuns) => Some(10_000),
        (PlanTier::Enterprise, UsageCategory::AutomationRuns) => None,

        (PlanTier::Free, UsageCategory::Invoices) => Some(5),
        (PlanTier::Starter, UsageCategory::Invoices) => Some(100),
        (PlanTier::Growth, UsageCategory::Invoices) => Some(1_000),
        (PlanTier::Enterprise, UsageCategory::Invoices) => None,

        (PlanTier::Free, UsageCategory::AiMessages) => Some(0),
        (PlanTier::Starter, UsageCategory::AiMessages) => Some(0),
        (PlanTier::Growth, UsageCategory::AiMessages) => Some(500),
        (PlanTier::Enterprise, UsageCategory::AiMessages) => None,
    }
}

/// Maximum number of automation flows per tier, `None` = unlimited.
pub fn flow_limit(tier: PlanTier) -> Option<i64> {
    match tier {
        PlanTier::Free => Some(2),
        PlanTier::Starter => Some(10),
        PlanTier::Growth => Some(50),
        PlanTier::Enterprise => None,
    }
}

/// Start of the current UTC calendar month.
pub fn month_start_utc(now: OffsetDateTime) -> OffsetDateTime {
    // Day 1 always exists; replace_day(1) on a valid date cannot fail.
    now.replace_time(Time::MIDNIGHT)
        .replace_day(1)
        .unwrap_or_else(|_| now.replace_time(Time::MIDNIGHT))
}

/// Why a usage check denied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageDenial {
    /// Plan does not include this capability at all, or trial access is
    /// disallowed for the category.
    PaymentRequired,
    /// Capability present but the monthly quota is exhausted.
    QuotaExceeded,
}

/// Result of a usage check.
#[derive(Debug, Clone, Serialize)]
pub struct UsageDecision {
    pub allowed: bool,
    pub tier: PlanTier,
    /// `None` = unlimited.
    pub limit: Option<i64>,
    pub used: i64,
    pub denial: Option<UsageDenial>,
}

/// Pure decision core: given the resolved entitlement, the quota and the
/// live count, decide.
fn decide(
    entitlement: &Entitlement,
    category: UsageCategory,
    allow_trial: bool,
    used: i64,
) -> UsageDecision {
    let tier = entitlement.tier;

    if !entitlement.features.dashboard
        || (entitlement.is_trial_active && !(allow_trial && category.allows_trial()))
    {
        return UsageDecision {
            allowed: false,
            tier,
            limit: quota(tier, category),
            used,
            denial: Some(UsageDenial::PaymentRequired),
        };
    }

    match quota(tier, category) {
        None => UsageDecision {
            allowed: true,
            tier,
            limit: None,
            used,
            denial: None,
        },
        Some(limit) if used >= limit => UsageDecision {
            allowed: false,
            tier,
            limit: Some(limit),
            used,
            denial: Some(if limit == 0 {
                UsageDenial::PaymentRequired
            } else {
                UsageDenial::QuotaExceeded
            }),
        },
        Some(limit) => UsageDecision {
            allowed: true,
            tier,
            limit: Some(limit),
            used,
            denial: None,
        },
    }
}

/// Outcome of a guarded flow creation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlowCreation {
    Created { flow_id: Uuid },
    LimitReached { limit: i64, used: i64 },
}

#[derive(Clone)]
pub struct UsageMeter {
    pool: PgPool,
    entitlements: EntitlementService,
    audit: BillingEventLogger,
}

impl UsageMeter {
    pub fn new(pool: PgPool, email: BillingEmailService) -> Self {
        let entitlements = EntitlementService::new(pool.clone(), email);
        let audit = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            entitlements,
            audit,
        }
    }

    /// Check whether `user_id` may consume one more unit of `category`.
    ///
    /// Fails closed: an entitlement that denies the platform, or a trial
    /// where the category disallows trials, is a payment_required denial
    /// before any counting happens.
    pub async fn enforce(
        &self,
        user_id: Uuid,
        category: UsageCategory,
        allow_trial: bool,
    ) -> BillingResult<UsageDecision> {
        let entitlement = self.entitlements.resolve(user_id).await?;

        // Unlimited plans skip the count query entirely.
        let used = if quota(entitlement.tier, category).is_some() {
            self.count_since_month_start(user_id, category).await?
        } else {
            0
        };

        let decision = decide(&entitlement, category, allow_trial, used);
        if !decision.allowed {
            tracing::info!(
                user_id = %user_id,
                category = %category,
                tier = %decision.tier,
                used = decision.used,
                limit = ?decision.limit,
                "usage denied"
            );
        }
        Ok(decision)
    }

    /// Count domain rows for the category created since the start of the
    /// current UTC month. Always recomputed from the rows themselves.
    async fn count_since_month_start(
        &self,
        user_id: Uuid,
        category: UsageCategory,
    ) -> BillingResult<i64> {
        let since = month_start_utc(OffsetDateTime::now_utc());
        let query = match category {
            UsageCategory::AutomationRuns => {
                "SELECT COUNT(*) FROM automation_runs WHERE user_id = $1 AND created_at >= $2"
            }
            UsageCategory::Invoices => {
                "SELECT COUNT(*) FROM invoices WHERE user_id = $1 AND created_at >= $2"
            }
            UsageCategory::AiMessages => {
                "SELECT COUNT(*) FROM ai_usage WHERE user_id = $1 AND created_at >= $2"
            }
        };

        let (count,): (i64,) = sqlx::query_as(query)
            .bind(user_id)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Create an automation flow if the user's flow count permits.
    ///
    /// Count and insert run in one transaction holding the per-user advisory
    /// lock, so two concurrent requests at `limit - 1` cannot both pass the
    /// count: exactly one creates, the other observes the new total.
    pub async fn create_flow_within_limit(
        &self,
        user_id: Uuid,
        name: &str,
    ) -> BillingResult<FlowCreation> {
        let entitlement = self.entitlements.resolve(user_id).await?;
        let limit = flow_limit(entitlement.tier);

        let mut tx = self.pool.begin().await?;
        acquire_user_lock(&mut tx, user_id).await?;

        let (used,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM automation_flows WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        if let Some(limit) = limit {
            if used >= limit {
                tx.rollback().await?;

                if let Err(e) = self
                    .audit
                    .log(
                        BillingEventBuilder::new(BillingEventType::FlowLimitReached)
                            .user(user_id)
                            .data(serde_json::json!({ "limit": limit, "used": used })),
                    )
                    .await
                {
                    tracing::warn!(user_id = %user_id, error = %e, "failed to audit flow limit");
                }

                return Ok(FlowCreation::LimitReached { limit, used });
            }
        }

        let flow_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO automation_flows (id, user_id, name, status, created_at)
            VALUES ($1, $2, $3, 'enabled', NOW())
            "#,
        )
        .bind(flow_id)
        .bind(user_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(FlowCreation::Created { flow_id })
    }

    pub fn entitlements(&self) -> &EntitlementService {
        &self.entitlements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::compute_entitlement;
    use crate::entitlements::RawSubscription;
    use time::macros::datetime;
    use time::Duration;

    fn entitlement_for(plan: &str, status: &str, trial_ends_at: Option<OffsetDateTime>) -> Entitlement {
        let raw = RawSubscription {
            id: Uuid::new_v4(),
            plan: plan.into(),
            status: status.into(),
            trial_ends_at,
            created_at: OffsetDateTime::now_utc() - Duration::days(5),
        };
        compute_entitlement(Some(&raw), OffsetDateTime::now_utc())
    }

    #[test]
    fn month_start_is_day_one_midnight() {
        let now = datetime!(2026-03-17 14:33:21 UTC);
        assert_eq!(month_start_utc(now), datetime!(2026-03-01 00:00:00 UTC));
    }

    #[test]
    fn month_start_on_day_one_is_identity_at_midnight() {
        let now = datetime!(2026-03-01 00:00:00 UTC);
        assert_eq!(month_start_utc(now), now);
    }

    #[test]
    fn quota_is_monotonic_in_tier() {
        for category in [
            UsageCategory::AutomationRuns,
            UsageCategory::Invoices,
            UsageCategory::AiMessages,
        ] {
            let tiers = [
                PlanTier::Free,
                PlanTier::Starter,
                PlanTier::Growth,
                PlanTier::Enterprise,
            ];
            for pair in tiers.windows(2) {
                let lower = quota(pair[0], category);
                let higher = quota(pair[1], category);
                // None (unlimited) ranks above every finite limit.
                match (lower, higher) {
                    (Some(l), Some(h)) => assert!(l <= h, "{category} {:?}", pair),
                    (Some(_), None) => {}
                    (None, Some(_)) => panic!("quota shrank to finite at higher tier"),
                    (None, None) => {}
                }
            }
        }
    }

    #[test]
    fn under_quota_is_allowed() {
        let ent = entitlement_for("starter", "active", None);
        let decision = decide(&ent, UsageCategory::Invoices, false, 99);
        assert!(decision.allowed);
        assert_eq!(decision.limit, Some(100));
    }

    #[test]
    fn at_quota_is_denied() {
        let ent = entitlement_for("starter", "active", None);
        let decision = decide(&ent, UsageCategory::Invoices, false, 100);
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(UsageDenial::QuotaExceeded));
    }

    #[test]
    fn zero_quota_is_payment_required() {
        let ent = entitlement_for("starter", "active", None);
        let decision = decide(&ent, UsageCategory::AiMessages, false, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(UsageDenial::PaymentRequired));
    }

    #[test]
    fn enterprise_is_unlimited() {
        let ent = entitlement_for("enterprise", "active", None);
        let decision = decide(&ent, UsageCategory::AutomationRuns, false, 1_000_000);
        assert!(decision.allowed);
        assert_eq!(decision.limit, None);
    }

    #[test]
    fn trial_denied_when_category_disallows_trial() {
        let trial_end = OffsetDateTime::now_utc() + Duration::days(5);
        let ent = entitlement_for("growth", "trialing", Some(trial_end));
        assert!(ent.is_trial_active);

        let decision = decide(&ent, UsageCategory::AiMessages, true, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(UsageDenial::PaymentRequired));
    }

    #[test]
    fn trial_denied_when_caller_disallows_trial() {
        let trial_end = OffsetDateTime::now_utc() + Duration::days(5);
        let ent = entitlement_for("growth", "trialing", Some(trial_end));

        let decision = decide(&ent, UsageCategory::AutomationRuns, false, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(UsageDenial::PaymentRequired));
    }

    #[test]
    fn trial_allowed_for_trial_friendly_category() {
        let trial_end = OffsetDateTime::now_utc() + Duration::days(5);
        let ent = entitlement_for("growth", "trialing", Some(trial_end));

        let decision = decide(&ent, UsageCategory::AutomationRuns, true, 10);
        assert!(decision.allowed);
    }

    #[test]
    fn lapsed_trial_counts_as_free() {
        let trial_end = OffsetDateTime::now_utc() - Duration::days(1);
        let ent = entitlement_for("growth", "trialing", Some(trial_end));
        assert_eq!(ent.tier, PlanTier::Free);

        let decision = decide(&ent, UsageCategory::AutomationRuns, true, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.denial, Some(UsageDenial::PaymentRequired));
    }

    #[test]
    fn flow_limits_rank_with_tiers() {
        assert_eq!(flow_limit(PlanTier::Free), Some(2));
        assert_eq!(flow_limit(PlanTier::Starter), Some(10));
        assert_eq!(flow_limit(PlanTier::Growth), Some(50));
        assert_eq!(flow_limit(PlanTier::Enterprise), None);
    }
}
