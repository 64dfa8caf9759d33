//! Billing endpoints: synchronous verification, entitlements, usage.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use uuid::Uuid;

use flowline_billing::{BillingError, UsageCategory};
use flowline_shared::PaymentProvider;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated user id, injected by the upstream auth proxy.
pub fn require_user(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| BillingError::MissingMetadata("x-user-id header".into()).into())
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub provider: PaymentProvider,
    /// Merchant transaction reference from the checkout redirect.
    pub reference: String,
}

/// Client-initiated verification after a redirect-based checkout.
///
/// Fallback/accelerant to the async webhook: both paths run the same
/// verifier and reconciler, and the reference check under the per-user lock
/// guarantees they converge on one payment row whichever runs first, in
/// either order, or concurrently.
pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;

    // The verify endpoint triggers an outbound provider call; cap it.
    let limit = state.config.verify_rate_limit_per_minute;
    match state.rate_limiter.check(user_id, "verify", limit).await {
        Ok(result) if !result.allowed => {
            return Ok((
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate_limited",
                    "retry_after_seconds": result.retry_after_seconds,
                })),
            )
                .into_response());
        }
        Ok(_) => {}
        Err(e) => {
            // A broken limiter must not take down payment verification.
            tracing::warn!(error = %e, "rate limiter unavailable - allowing request");
        }
    }

    let verified = state
        .billing
        .verifier
        .fetch_transaction(request.provider, &request.reference)
        .await?;

    if verified.user_id != user_id {
        // A user may only verify their own transactions.
        return Err(BillingError::NotFound(format!(
            "transaction {} for this user",
            request.reference
        ))
        .into());
    }

    let outcome = state.billing.reconciler.apply(&verified).await?;
    Ok(Json(outcome).into_response())
}

/// Resolved entitlement for the requesting user.
pub async fn entitlements(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let entitlement = state.billing.entitlements.resolve(user_id).await?;
    Ok(Json(entitlement).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub allow_trial: bool,
}

/// Current usage decision for one category.
pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(category): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;
    let category = UsageCategory::from_str(&category)
        .map_err(|_| BillingError::NotFound(format!("usage category '{category}'")))?;

    let decision = state
        .billing
        .usage
        .enforce(user_id, category, query.allow_trial)
        .await?;

    if decision.allowed {
        Ok(Json(decision).into_response())
    } else {
        // Structured denial the UI can render as an upgrade prompt.
        Ok((
            axum::http::StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "type": "upgrade_required",
                "required_plan": required_plan_hint(category),
                "reason": decision.denial,
                "plan": decision.tier,
                "limit": decision.limit,
                "used": decision.used,
            })),
        )
            .into_response())
    }
}

/// Smallest tier whose quota for the category is non-zero.
fn required_plan_hint(category: UsageCategory) -> &'static str {
    use flowline_billing::quota;
    use flowline_shared::PlanTier;

    for tier in [PlanTier::Starter, PlanTier::Growth, PlanTier::Enterprise] {
        match quota(tier, category) {
            None => return tier.as_str(),
            Some(limit) if limit > 0 => return tier.as_str(),
            Some(_) => {}
        }
    }
    PlanTier::Enterprise.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_plan_hint_picks_first_usable_tier() {
        assert_eq!(required_plan_hint(UsageCategory::AutomationRuns), "starter");
        assert_eq!(required_plan_hint(UsageCategory::AiMessages), "growth");
        assert_eq!(required_plan_hint(UsageCategory::Invoices), "starter");
    }

    #[test]
    fn require_user_rejects_missing_and_malformed() {
        let empty = HeaderMap::new();
        assert!(require_user(&empty).is_err());

        let mut bad = HeaderMap::new();
        bad.insert("x-user-id", "not-a-uuid".parse().unwrap());
        assert!(require_user(&bad).is_err());

        let mut good = HeaderMap::new();
        let id = Uuid::new_v4();
        good.insert("x-user-id", id.to_string().parse().unwrap());
        assert_eq!(require_user(&good).unwrap(), id);
    }

    #[test]
    fn verify_request_deserializes_provider() {
        let req: VerifyRequest =
            serde_json::from_str(r#"{"provider":"paystack","reference":"ps_1"}"#).unwrap();
        assert_eq!(req.provider, PaymentProvider::Paystack);
    }
}
