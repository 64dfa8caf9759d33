// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Boundary conditions and adversarial inputs across:
//! - Webhook ledger claims (FLOW-L01 to FLOW-L05)
//! - Amount / currency gates (FLOW-A01 to FLOW-A06)
//! - Entitlement resolution (FLOW-E01 to FLOW-E06)
//! - Usage windows (FLOW-U01 to FLOW-U04)
//! - Step gate (FLOW-S01 to FLOW-S04)
//! - Signatures (FLOW-W01 to FLOW-W04)

#[cfg(test)]
mod ledger_claim_tests {
    use crate::ledger::{payload_hash, ClaimDisposition, EventStatus};

    // =========================================================================
    // FLOW-L01: First delivery of an event id - must claim for processing
    // =========================================================================
    #[test]
    fn test_first_delivery_claims() {
        assert_eq!(
            ClaimDisposition::for_existing(None),
            ClaimDisposition::Insert
        );
    }

    // =========================================================================
    // FLOW-L02: Redelivery after processed - must short-circuit as duplicate
    // =========================================================================
    #[test]
    fn test_processed_redelivery_is_duplicate() {
        assert_eq!(
            ClaimDisposition::for_existing(Some(EventStatus::Processed)),
            ClaimDisposition::Duplicate
        );
    }

    // =========================================================================
    // FLOW-L03: Redelivery after failure - must reclaim and retry
    // =========================================================================
    #[test]
    fn test_failed_redelivery_reclaims() {
        assert_eq!(
            ClaimDisposition::for_existing(Some(EventStatus::Failed)),
            ClaimDisposition::Reclaim
        );
    }

    // =========================================================================
    // FLOW-L04: Redelivery while still received (crashed handler) - reclaim
    // =========================================================================
    #[test]
    fn test_stuck_received_reclaims() {
        assert_eq!(
            ClaimDisposition::for_existing(Some(EventStatus::Received)),
            ClaimDisposition::Reclaim
        );
    }

    // =========================================================================
    // FLOW-L05: Payload hash distinguishes replay-with-different-body
    // =========================================================================
    #[test]
    fn test_payload_hash_detects_body_change() {
        let original = payload_hash(br#"{"amount":2000000}"#);
        let tampered = payload_hash(br#"{"amount":200000 }"#);
        assert_ne!(original, tampered);
    }
}

#[cfg(test)]
mod amount_gate_tests {
    use crate::pricing::{expected_price, provider_accepts};
    use flowline_shared::{Currency, PaymentProvider, Plan};

    // =========================================================================
    // FLOW-A01: Exact starter price in kobo
    // =========================================================================
    #[test]
    fn test_starter_ngn_price_is_exact() {
        assert_eq!(expected_price(Plan::Starter, Currency::Ngn), Some(2_000_000));
    }

    // =========================================================================
    // FLOW-A02: Tampered amount 15000 NGN for starter must not match
    // =========================================================================
    #[test]
    fn test_underpaid_amount_never_matches() {
        let expected = expected_price(Plan::Starter, Currency::Ngn).unwrap();
        assert_ne!(expected, 1_500_000);
    }

    // =========================================================================
    // FLOW-A03: One-minor-unit drift is a mismatch
    // =========================================================================
    #[test]
    fn test_one_unit_drift_is_mismatch() {
        let expected = expected_price(Plan::Growth, Currency::Usd).unwrap();
        assert_ne!(expected, expected - 1);
        assert_ne!(expected, expected + 1);
    }

    // =========================================================================
    // FLOW-A04: Cross-plan amount must not activate a different plan
    // =========================================================================
    #[test]
    fn test_cross_plan_amounts_are_distinct() {
        for currency in [Currency::Ngn, Currency::Usd] {
            let starter = expected_price(Plan::Starter, currency).unwrap();
            let growth = expected_price(Plan::Growth, currency).unwrap();
            let enterprise = expected_price(Plan::Enterprise, currency).unwrap();
            assert_ne!(starter, growth);
            assert_ne!(growth, enterprise);
        }
    }

    // =========================================================================
    // FLOW-A05: USD through the NGN-only provider is structurally invalid
    // =========================================================================
    #[test]
    fn test_usd_through_paystack_rejected() {
        assert!(!provider_accepts(PaymentProvider::Paystack, Currency::Usd));
    }

    // =========================================================================
    // FLOW-A06: NGN amounts and USD amounts are on different scales
    // =========================================================================
    #[test]
    fn test_ngn_amount_never_matches_usd_price() {
        // A USD-priced plan paid with the NGN amount (or vice versa) must
        // fail the equality check rather than accidentally matching.
        let usd = expected_price(Plan::Starter, Currency::Usd).unwrap();
        let ngn = expected_price(Plan::Starter, Currency::Ngn).unwrap();
        assert_ne!(usd, ngn);
    }
}

#[cfg(test)]
mod entitlement_tests {
    use crate::entitlements::{compute_entitlement, RawSubscription};
    use flowline_shared::PlanTier;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn raw(plan: &str, status: &str, trial_ends_at: Option<OffsetDateTime>) -> RawSubscription {
        RawSubscription {
            id: Uuid::new_v4(),
            plan: plan.into(),
            status: status.into(),
            trial_ends_at,
            created_at: OffsetDateTime::now_utc() - Duration::days(14),
        }
    }

    // =========================================================================
    // FLOW-E01: Trial lapse at the exact boundary second
    // =========================================================================
    #[test]
    fn test_trial_boundary_second() {
        let now = OffsetDateTime::now_utc();

        // trial_ends_at == now: still active (>= comparison)
        let at_boundary = compute_entitlement(Some(&raw("growth", "trialing", Some(now))), now);
        assert!(at_boundary.is_trial_active);

        // One second past: lapsed
        let lapsed = compute_entitlement(
            Some(&raw("growth", "trialing", Some(now - Duration::seconds(1)))),
            now,
        );
        assert_eq!(lapsed.tier, PlanTier::Free);
        assert!(lapsed.trial_lapsed);
    }

    // =========================================================================
    // FLOW-E02: Repeated resolution after lapse is stable (read-only lapse)
    // =========================================================================
    #[test]
    fn test_repeated_lapse_resolution_is_stable() {
        let now = OffsetDateTime::now_utc();
        let row = raw("starter", "trialing", Some(now - Duration::days(3)));

        for offset in [0i64, 1, 60, 3600, 86_400] {
            let ent = compute_entitlement(Some(&row), now + Duration::seconds(offset));
            assert_eq!(ent.tier, PlanTier::Free);
            assert!(ent.trial_lapsed);
        }
    }

    // =========================================================================
    // FLOW-E03: Active subscription ignores a stale trial_ends_at
    // =========================================================================
    #[test]
    fn test_active_ignores_stale_trial_date() {
        // A trial that converted leaves trial_ends_at behind on the row.
        let now = OffsetDateTime::now_utc();
        let ent = compute_entitlement(
            Some(&raw("growth", "active", Some(now - Duration::days(10)))),
            now,
        );
        assert_eq!(ent.tier, PlanTier::Growth);
        assert!(!ent.is_trial_active);
        assert!(!ent.trial_lapsed);
    }

    // =========================================================================
    // FLOW-E04: Unknown status string fails closed
    // =========================================================================
    #[test]
    fn test_unknown_status_fails_closed() {
        let now = OffsetDateTime::now_utc();
        let ent = compute_entitlement(Some(&raw("growth", "paused", None)), now);
        assert_eq!(ent.tier, PlanTier::Free);
        assert!(ent.plan_invariant_violation);
    }

    // =========================================================================
    // FLOW-E05: Enterprise active grants everything outside trial
    // =========================================================================
    #[test]
    fn test_enterprise_active_full_feature_set() {
        let now = OffsetDateTime::now_utc();
        let ent = compute_entitlement(Some(&raw("enterprise", "active", None)), now);
        assert!(ent.features.automations);
        assert!(ent.features.ai_assistant);
        assert!(ent.features.whatsapp);
        assert!(ent.features.invoicing);
    }

    // =========================================================================
    // FLOW-E06: Enterprise trial still withholds AI and WhatsApp
    // =========================================================================
    #[test]
    fn test_enterprise_trial_withholds_ai() {
        let now = OffsetDateTime::now_utc();
        let ent = compute_entitlement(
            Some(&raw("enterprise", "trialing", Some(now + Duration::days(7)))),
            now,
        );
        assert_eq!(ent.tier, PlanTier::Enterprise);
        assert!(!ent.features.ai_assistant);
        assert!(!ent.features.whatsapp);
        assert!(ent.features.automations);
    }
}

#[cfg(test)]
mod usage_window_tests {
    use crate::usage::month_start_utc;
    use time::macros::datetime;

    // =========================================================================
    // FLOW-U01: Mid-month timestamp truncates to day 1 midnight
    // =========================================================================
    #[test]
    fn test_mid_month_truncates() {
        assert_eq!(
            month_start_utc(datetime!(2026-08-07 09:15:00 UTC)),
            datetime!(2026-08-01 00:00:00 UTC)
        );
    }

    // =========================================================================
    // FLOW-U02: Last second of the month still counts in that month
    // =========================================================================
    #[test]
    fn test_month_end_boundary() {
        assert_eq!(
            month_start_utc(datetime!(2026-01-31 23:59:59 UTC)),
            datetime!(2026-01-01 00:00:00 UTC)
        );
    }

    // =========================================================================
    // FLOW-U03: First second of the month opens a fresh window
    // =========================================================================
    #[test]
    fn test_month_start_boundary() {
        assert_eq!(
            month_start_utc(datetime!(2026-02-01 00:00:00 UTC)),
            datetime!(2026-02-01 00:00:00 UTC)
        );
    }

    // =========================================================================
    // FLOW-U04: Leap-year February is handled by the date type
    // =========================================================================
    #[test]
    fn test_leap_february() {
        assert_eq!(
            month_start_utc(datetime!(2028-02-29 12:00:00 UTC)),
            datetime!(2028-02-01 00:00:00 UTC)
        );
    }
}

#[cfg(test)]
mod step_gate_tests {
    use crate::gate::{requirement, StepKind};
    use crate::usage::UsageCategory;
    use flowline_shared::PlanTier;

    // =========================================================================
    // FLOW-S01: AI step is growth-or-higher and never trial-accessible
    // =========================================================================
    #[test]
    fn test_ai_step_requirement() {
        let req = requirement(StepKind::AiComplete);
        assert_eq!(req.minimum_tier, PlanTier::Growth);
        assert!(!req.allow_trial);
    }

    // =========================================================================
    // FLOW-S02: Metered steps name the category they consume
    // =========================================================================
    #[test]
    fn test_metered_steps_have_categories() {
        assert_eq!(
            requirement(StepKind::HttpRequest).usage,
            Some(UsageCategory::AutomationRuns)
        );
        assert_eq!(
            requirement(StepKind::AiComplete).usage,
            Some(UsageCategory::AiMessages)
        );
    }

    // =========================================================================
    // FLOW-S03: Control-flow steps consume nothing
    // =========================================================================
    #[test]
    fn test_delay_consumes_nothing() {
        assert!(requirement(StepKind::Delay).usage.is_none());
    }

    // =========================================================================
    // FLOW-S04: No step requires more than the top tier
    // =========================================================================
    #[test]
    fn test_requirements_within_tier_range() {
        for kind in [
            StepKind::HttpRequest,
            StepKind::SendEmail,
            StepKind::GeneratePdf,
            StepKind::AiComplete,
            StepKind::WhatsappSend,
            StepKind::Delay,
        ] {
            assert!(PlanTier::Enterprise.is_at_least(requirement(kind).minimum_tier));
        }
    }
}

#[cfg(test)]
mod signature_tests {
    use crate::providers::PaystackClient;
    use flowline_shared::Environment;
    use hmac::{Hmac, Mac};
    use sha2::Sha512;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn client(secret: &str) -> PaystackClient {
        PaystackClient::new(
            Some(secret.to_string()),
            "https://api.paystack.co".to_string(),
            Environment::Production,
        )
    }

    // =========================================================================
    // FLOW-W01: Empty body still verifies when correctly signed
    // =========================================================================
    #[test]
    fn test_empty_body_signed() {
        let c = client("sk_test_abc");
        let sig = sign("sk_test_abc", b"");
        assert!(c.verify_signature(&sig, b"").is_ok());
    }

    // =========================================================================
    // FLOW-W02: Empty signature header is rejected
    // =========================================================================
    #[test]
    fn test_empty_signature_rejected() {
        let c = client("sk_test_abc");
        assert!(c.verify_signature("", b"{}").is_err());
    }

    // =========================================================================
    // FLOW-W03: Truncated signature is rejected
    // =========================================================================
    #[test]
    fn test_truncated_signature_rejected() {
        let c = client("sk_test_abc");
        let sig = sign("sk_test_abc", b"{}");
        assert!(c.verify_signature(&sig[..sig.len() - 2], b"{}").is_err());
    }

    // =========================================================================
    // FLOW-W04: Signature over a different body is rejected (replay guard)
    // =========================================================================
    #[test]
    fn test_replayed_signature_rejected() {
        let c = client("sk_test_abc");
        let sig = sign("sk_test_abc", br#"{"event":"charge.success","amount":2000000}"#);
        assert!(c
            .verify_signature(&sig, br#"{"event":"charge.success","amount":9000000}"#)
            .is_err());
    }
}
