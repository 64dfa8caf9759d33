//! Provider webhook endpoints.
//!
//! Response policy (what makes the provider redeliver):
//! - invalid signature: 401, no state change at all
//! - unparsable envelope: 400, no state change
//! - ledger claim failure: 500 - an event we could not record must be
//!   redelivered, silent acceptance would lose it permanently
//! - provider fetch transport failure: 502, event left `received` so the
//!   provider's own retry drives the next attempt
//! - business rejections (amount mismatch, unsupported currency, transaction
//!   not found): 200 with a structured body - redelivery cannot fix a
//!   structurally wrong event, the review trail is the follow-up
//! - duplicates and successful application: 200

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use flowline_billing::{payload_hash, BillingError, ReconcileOutcome};
use flowline_shared::PaymentProvider;

use crate::error::ApiError;
use crate::state::AppState;

/// Webhook event names that represent a completed charge, per provider.
/// Everything else is acknowledged and ignored.
fn is_charge_event(provider: PaymentProvider, event: &str) -> bool {
    match provider {
        PaymentProvider::Paystack => event == "charge.success",
        PaymentProvider::Flutterwave => event == "charge.completed",
    }
}

fn signature_header(provider: PaymentProvider) -> &'static str {
    match provider {
        PaymentProvider::Paystack => "x-paystack-signature",
        PaymentProvider::Flutterwave => "verif-hash",
    }
}

/// The minimal envelope we read off the raw body. Amounts and statuses in
/// here are never trusted; only the provider's verify endpoint is
/// authoritative for those.
#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: Option<String>,
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    id: Option<serde_json::Value>,
    reference: Option<String>,
    tx_ref: Option<String>,
}

impl WebhookEnvelope {
    /// Provider event id, as a string whatever the wire type.
    fn event_id(&self) -> Option<String> {
        match self.data.as_ref()?.id.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Merchant transaction reference (`reference` or `tx_ref`).
    fn reference(&self) -> Option<&str> {
        let data = self.data.as_ref()?;
        data.reference.as_deref().or(data.tx_ref.as_deref())
    }
}

pub async fn paystack(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle(state, PaymentProvider::Paystack, headers, body).await
}

pub async fn flutterwave(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle(state, PaymentProvider::Flutterwave, headers, body).await
}

async fn handle(
    state: AppState,
    provider: PaymentProvider,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let billing = &state.billing;

    // Gate 1: transport authenticity, before any state change.
    let signature = headers
        .get(signature_header(provider))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    billing.verifier.verify_signature(provider, signature, &body)?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| BillingError::MissingMetadata(format!("unparsable body: {e}")))?;
    let event_id = envelope
        .event_id()
        .ok_or_else(|| BillingError::MissingMetadata("event id".into()))?;

    // Dedupe claim. A failure here propagates as 500 deliberately.
    let claim = billing
        .ledger
        .begin_event(provider, &event_id, &payload_hash(&body))
        .await?;
    if claim.duplicate {
        return Ok(ack(json!({ "status": "duplicate", "duplicate": true })));
    }

    // Non-charge notifications are acknowledged and closed out.
    let event_name = envelope.event.as_deref().unwrap_or("");
    if !is_charge_event(provider, event_name) {
        billing.ledger.mark_processed(claim.id).await?;
        return Ok(ack(json!({ "status": "ignored", "event": event_name })));
    }

    let Some(reference) = envelope.reference() else {
        billing
            .ledger
            .mark_failed(claim.id, "missing transaction reference")
            .await?;
        return Err(BillingError::MissingMetadata("transaction reference".into()).into());
    };

    // Gate 2: authoritative re-verification at the provider.
    let verified = match billing.verifier.fetch_transaction(provider, reference).await {
        Ok(v) => v,
        Err(BillingError::VerificationFailed(reason)) => {
            // The provider does not know this transaction. Redelivery cannot
            // fix that; acknowledge and leave the failure on record.
            billing.ledger.mark_failed(claim.id, &reason).await?;
            return Ok(ack(json!({ "status": "verification_failed" })));
        }
        Err(err @ BillingError::MissingMetadata(_)) => {
            let reason = err.to_string();
            billing.ledger.mark_failed(claim.id, &reason).await?;
            return Err(err.into());
        }
        Err(err) => {
            // Transport-level failure: leave the event `received` so the
            // provider-driven retry picks it up.
            return Err(err.into());
        }
    };

    match billing.reconciler.apply(&verified).await {
        Ok(outcome) => {
            billing.ledger.mark_processed(claim.id).await?;
            let status = match &outcome {
                ReconcileOutcome::Applied { .. } => "applied",
                ReconcileOutcome::AlreadyApplied { .. } => "duplicate_reference",
                ReconcileOutcome::NotSuccessful { .. } => "not_successful",
                ReconcileOutcome::CurrencyUnsupported { .. } => "needs_review",
            };
            Ok(ack(json!({ "status": status })))
        }
        Err(BillingError::AmountMismatch { .. }) => {
            // Potential fraud or pricing drift. The event stays failed (not
            // processed) so it can never be mistaken for a success, but the
            // provider gets a 200: retrying cannot make the amount right.
            billing.ledger.mark_failed(claim.id, "amount_mismatch").await?;
            Ok(ack(json!({ "status": "amount_mismatch", "needs_review": true })))
        }
        Err(err) => {
            // Reconciliation infrastructure failure: leave `received` for
            // redelivery.
            Err(err.into())
        }
    }
}

fn ack(body: serde_json::Value) -> Response {
    Json(body).into_response()
}
