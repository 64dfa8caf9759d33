//! Automation step gate.
//!
//! Every plan-restricted workflow step consults this gate before executing.
//! Step kinds are a closed sum type with an exhaustively matched requirement
//! table: adding a step kind is a compile-time-checked extension, there is no
//! string-keyed dispatch and no silent "unknown step" fallback.
//!
//! A denial aborts the step, not the run: the caller receives a structured
//! decision and an `upgrade_required` audit entry is appended.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowline_shared::PlanTier;

use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::usage::{UsageCategory, UsageDenial, UsageMeter};

/// Workflow step kinds the engine can execute. Step bodies live in the
/// engine; the gate only cares about what running one would consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    HttpRequest,
    SendEmail,
    GeneratePdf,
    AiComplete,
    WhatsappSend,
    Delay,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::HttpRequest => "http_request",
            StepKind::SendEmail => "send_email",
            StepKind::GeneratePdf => "generate_pdf",
            StepKind::AiComplete => "ai_complete",
            StepKind::WhatsappSend => "whatsapp_send",
            StepKind::Delay => "delay",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What executing a step requires of the user's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRequirement {
    /// Minimum tier that may run the step at all.
    pub minimum_tier: PlanTier,
    /// Usage category consumed by the step, if metered.
    pub usage: Option<UsageCategory>,
    /// Whether an active trial satisfies the requirement.
    pub allow_trial: bool,
}

/// The requirement table. Exhaustive over [`StepKind`]: a new step kind
/// fails to compile until it gets a row here.
pub fn requirement(kind: StepKind) -> StepRequirement {
    match kind {
        StepKind::HttpRequest | StepKind::SendEmail | StepKind::GeneratePdf => StepRequirement {
            minimum_tier: PlanTier::Starter,
            usage: Some(UsageCategory::AutomationRuns),
            allow_trial: true,
        },
        StepKind::AiComplete => StepRequirement {
            minimum_tier: PlanTier::Growth,
            usage: Some(UsageCategory::AiMessages),
            allow_trial: false,
        },
        StepKind::WhatsappSend => StepRequirement {
            minimum_tier: PlanTier::Growth,
            usage: Some(UsageCategory::AutomationRuns),
            allow_trial: false,
        },
        // Pure control flow, nothing consumed.
        StepKind::Delay => StepRequirement {
            minimum_tier: PlanTier::Free,
            usage: None,
            allow_trial: true,
        },
    }
}

/// Gate verdict handed back to the workflow engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allowed,
    Denied {
        required_plan: PlanTier,
        reason: String,
    },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }
}

#[derive(Clone)]
pub struct StepGate {
    usage: UsageMeter,
    audit: BillingEventLogger,
}

impl StepGate {
    pub fn new(usage: UsageMeter, audit: BillingEventLogger) -> Self {
        Self { usage, audit }
    }

    /// May `user_id` run one step of `kind` right now?
    ///
    /// Consults the entitlement resolver and, for metered kinds, the usage
    /// limiter. Deny aborts the step only; the engine continues the run.
    pub async fn authorize(&self, user_id: Uuid, kind: StepKind) -> BillingResult<GateDecision> {
        let req = requirement(kind);

        let entitlement = self.usage.entitlements().resolve(user_id).await?;

        if !entitlement.tier.is_at_least(req.minimum_tier) {
            return self
                .deny(user_id, kind, req.minimum_tier, "plan_too_low")
                .await;
        }
        if entitlement.is_trial_active && !req.allow_trial {
            return self
                .deny(user_id, kind, req.minimum_tier, "trial_not_eligible")
                .await;
        }

        if let Some(category) = req.usage {
            let decision = self
                .usage
                .enforce(user_id, category, req.allow_trial)
                .await?;
            if !decision.allowed {
                let reason = match decision.denial {
                    Some(UsageDenial::QuotaExceeded) => "quota_exceeded",
                    _ => "payment_required",
                };
                return self.deny(user_id, kind, req.minimum_tier, reason).await;
            }
        }

        Ok(GateDecision::Allowed)
    }

    async fn deny(
        &self,
        user_id: Uuid,
        kind: StepKind,
        required_plan: PlanTier,
        reason: &str,
    ) -> BillingResult<GateDecision> {
        tracing::info!(
            user_id = %user_id,
            step_kind = %kind,
            required_plan = %required_plan,
            reason = %reason,
            "upgrade_required: step denied"
        );

        if let Err(e) = self
            .audit
            .log(
                BillingEventBuilder::new(BillingEventType::UpgradeRequired)
                    .user(user_id)
                    .data(serde_json::json!({
                        "step_kind": kind.as_str(),
                        "required_plan": required_plan.as_str(),
                        "reason": reason,
                    })),
            )
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "failed to audit step denial");
        }

        Ok(GateDecision::Denied {
            required_plan,
            reason: reason.to_string(),
        })
    }
}
