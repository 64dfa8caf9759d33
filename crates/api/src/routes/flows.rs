//! Automation flow endpoints (quota-gated creation).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use flowline_billing::FlowCreation;

use crate::error::ApiError;
use crate::routes::billing::require_user;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateFlowRequest {
    pub name: String,
}

/// Create an automation flow.
///
/// The count-against-limit and the insert run under the per-user advisory
/// lock inside the billing crate, so concurrent requests cannot overshoot
/// the plan's flow quota.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateFlowRequest>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&headers)?;

    match state
        .billing
        .usage
        .create_flow_within_limit(user_id, &request.name)
        .await?
    {
        FlowCreation::Created { flow_id } => Ok((
            StatusCode::CREATED,
            Json(json!({ "id": flow_id, "name": request.name })),
        )
            .into_response()),
        FlowCreation::LimitReached { limit, used } => Ok((
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "type": "upgrade_required",
                "reason": "flow_limit_reached",
                "limit": limit,
                "used": used,
            })),
        )
            .into_response()),
    }
}
