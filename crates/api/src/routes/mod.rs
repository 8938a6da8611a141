//! Route definitions

pub mod admin;
pub mod webhooks;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payments", post(webhooks::handle_payment_webhook))
        .route("/admin/cases/{id}", get(admin::get_case))
        .route("/admin/cases/{id}/escalate", post(admin::escalate_case))
        .route("/admin/cases/{id}/mark-paid", post(admin::mark_case_paid))
        .route("/admin/cases/{id}/cancel", post(admin::cancel_case))
        .route("/admin/cases/{id}/payments", post(admin::record_payment))
        .route(
            "/admin/collection-cases/{id}",
            get(admin::get_collection_case),
        )
        .route(
            "/admin/collection-cases/{id}/revalidate",
            post(admin::revalidate_collection_case),
        )
        .route(
            "/admin/collection-cases/{id}/reference",
            post(admin::update_reference),
        )
        .route(
            "/admin/collection-cases/{id}/reassign-agency",
            post(admin::reassign_agency),
        )
        .route(
            "/admin/exports",
            post(admin::create_export).get(admin::list_exports),
        )
        .route("/admin/exports/{id}", get(admin::get_export))
        .route(
            "/admin/exports/{id}/confirm-receipt",
            post(admin::confirm_receipt),
        )
        .route("/admin/notices/dispatch", post(admin::dispatch_notices))
        .route("/admin/notices/{id}/requeue", post(admin::requeue_notice))
        .route("/admin/audit/{entity_id}", get(admin::entity_audit))
        .route("/admin/invariants", get(admin::run_invariants))
        .route("/admin/invariants/{name}", get(admin::run_invariant))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(tessera_collections::CollectionsError::from)?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
