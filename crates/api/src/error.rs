//! HTTP error mapping.
//!
//! The propagation policy in one place: transport/infrastructure failures
//! answer with statuses that make the provider redeliver; business
//! rejections are handled inline by the webhook routes (they acknowledge
//! with 200 plus a review trail) and never reach this type. End users only
//! ever see a structured code, never internal error detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use flowline_billing::BillingError;

#[derive(Debug)]
pub struct ApiError(pub BillingError);

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            BillingError::SignatureInvalid => (StatusCode::UNAUTHORIZED, "signature_invalid"),
            BillingError::ProviderNotConfigured(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_not_configured")
            }
            BillingError::MissingMetadata(_) => (StatusCode::BAD_REQUEST, "missing_metadata"),
            BillingError::VerificationFailed(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "verification_failed")
            }
            BillingError::AmountMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "amount_mismatch")
            }
            BillingError::CurrencyUnsupported { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "currency_unsupported")
            }
            BillingError::DuplicateReference(_) | BillingError::DuplicateEvent => {
                (StatusCode::OK, "duplicate")
            }
            BillingError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            BillingError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_unavailable"),
            BillingError::Database(_) | BillingError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        // Log the detail server-side; the body carries only the code.
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::info!(error = %self.0, code = code, "request rejected");
        }

        (status, Json(json!({ "error": code }))).into_response()
    }
}
