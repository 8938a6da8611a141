//! Payment processor webhook endpoint.
//!
//! The body must be the raw payload; signature verification covers the exact
//! bytes the processor signed.

use axum::{extract::State, http::HeaderMap, http::StatusCode};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing stripe-signature header".to_string()))?;

    let event = state.collections.webhooks.verify_event(&body, signature)?;
    state.collections.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}
