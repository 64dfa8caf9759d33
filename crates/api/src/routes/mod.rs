//! Route tree.

pub mod billing;
pub mod flows;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Provider webhooks (raw body, signature-checked)
        .route("/webhooks/paystack", post(webhooks::paystack))
        .route("/webhooks/flutterwave", post(webhooks::flutterwave))
        // Billing
        .route("/billing/verify", post(billing::verify))
        .route("/billing/entitlements", get(billing::entitlements))
        .route("/billing/usage/{category}", get(billing::usage))
        // Automation flows
        .route("/flows", post(flows::create))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
