//! Operator routes
//!
//! Every route requires the operator bearer token; the acting operator's
//! email is carried into the audit trail on each mutation.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_collections::{
    AuditRecord, CollectionCase, CollectionExport, DispatchSummary, DunningCase,
    EscalationOutcome, ExportRequest, InvariantCheckSummary, InvariantViolation, NoticeRecord,
    PaymentRetryRecord,
};

use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    /// Bypass the deadline check. The case must still be open.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EscalateResponse {
    /// Level advanced by one; a notice is on its way out.
    Escalated { case: DunningCase },
    /// The case sat at level 3; it was handed to debt collection instead.
    ConvertedToCollection {
        case: DunningCase,
        collection_case: CollectionCase,
    },
}

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct CaseDetailResponse {
    pub case: DunningCase,
    pub notices: Vec<NoticeRecord>,
    pub retry_history: Vec<PaymentRetryRecord>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReferenceRequest {
    pub reference_number: String,
}

#[derive(Debug, Deserialize)]
pub struct ReassignAgencyRequest {
    pub agency_name: String,
    pub agency_contact: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateExportRequest {
    pub agency_name: String,
    pub agency_contact: Option<String>,
    pub notes: Option<String>,
    pub case_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListExportsQuery {
    pub limit: Option<i64>,
}

// =============================================================================
// Dunning Cases
// =============================================================================

pub async fn get_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CaseDetailResponse>> {
    require_operator(&state.config, &headers)?;

    let case = state.collections.dunning.get(id).await?;
    let notices = state.collections.dunning.notices(id).await?;
    let retry_history = state
        .collections
        .ledger
        .for_subscription(case.subscription_id)
        .await?;

    Ok(Json(CaseDetailResponse {
        case,
        notices,
        retry_history,
    }))
}

pub async fn escalate_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<EscalateRequest>,
) -> ApiResult<Json<EscalateResponse>> {
    let actor = require_operator(&state.config, &headers)?;

    let outcome = state
        .collections
        .dunning
        .escalate(id, &actor, request.force)
        .await?;

    let response = match outcome {
        EscalationOutcome::Escalated(case) => EscalateResponse::Escalated { case },
        EscalationOutcome::FinalLevelReached(case) => {
            let collection_case = state.collections.converter.convert(case.id, &actor).await?;
            EscalateResponse::ConvertedToCollection {
                case,
                collection_case,
            }
        }
    };

    Ok(Json(response))
}

pub async fn mark_case_paid(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DunningCase>> {
    let actor = require_operator(&state.config, &headers)?;
    let case = state.collections.dunning.mark_paid(id, &actor).await?;
    Ok(Json(case))
}

pub async fn cancel_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DunningCase>> {
    let actor = require_operator(&state.config, &headers)?;
    let case = state.collections.dunning.cancel(id, &actor).await?;
    Ok(Json(case))
}

pub async fn record_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<RecordPaymentRequest>,
) -> ApiResult<Json<DunningCase>> {
    let actor = require_operator(&state.config, &headers)?;

    if request.amount_cents <= 0 {
        return Err(ApiError::BadRequest(
            "amount_cents must be positive".to_string(),
        ));
    }

    let case = state
        .collections
        .dunning
        .record_payment(id, request.amount_cents, &actor)
        .await?;

    Ok(Json(case))
}

// =============================================================================
// Collection Cases
// =============================================================================

pub async fn get_collection_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CollectionCase>> {
    require_operator(&state.config, &headers)?;
    let case = state.collections.converter.get(id).await?;
    Ok(Json(case))
}

pub async fn revalidate_collection_case(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CollectionCase>> {
    let actor = require_operator(&state.config, &headers)?;
    let case = state.collections.converter.revalidate(id, &actor).await?;
    Ok(Json(case))
}

pub async fn update_reference(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateReferenceRequest>,
) -> ApiResult<Json<CollectionCase>> {
    let actor = require_operator(&state.config, &headers)?;
    let case = state
        .collections
        .converter
        .update_reference_number(id, &request.reference_number, &actor)
        .await?;
    Ok(Json(case))
}

pub async fn reassign_agency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<ReassignAgencyRequest>,
) -> ApiResult<Json<CollectionCase>> {
    let actor = require_operator(&state.config, &headers)?;
    let case = state
        .collections
        .converter
        .reassign_agency(
            id,
            &request.agency_name,
            request.agency_contact.as_deref(),
            &actor,
        )
        .await?;
    Ok(Json(case))
}

// =============================================================================
// Exports
// =============================================================================

pub async fn create_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateExportRequest>,
) -> ApiResult<Json<CollectionExport>> {
    let actor = require_operator(&state.config, &headers)?;

    let export = state
        .collections
        .exports
        .create_batch(
            ExportRequest {
                agency_name: request.agency_name,
                agency_contact: request.agency_contact,
                notes: request.notes,
                case_ids: request.case_ids,
            },
            &actor,
        )
        .await?;

    Ok(Json(export))
}

pub async fn list_exports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListExportsQuery>,
) -> ApiResult<Json<Vec<CollectionExport>>> {
    require_operator(&state.config, &headers)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let exports = state.collections.exports.list(limit).await?;
    Ok(Json(exports))
}

pub async fn get_export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CollectionExport>> {
    require_operator(&state.config, &headers)?;
    let export = state.collections.exports.get(id).await?;
    Ok(Json(export))
}

pub async fn confirm_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CollectionExport>> {
    let actor = require_operator(&state.config, &headers)?;
    let export = state.collections.exports.confirm_receipt(id, &actor).await?;
    Ok(Json(export))
}

// =============================================================================
// Notices
// =============================================================================

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub requeued: bool,
}

pub async fn requeue_notice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RequeueResponse>> {
    require_operator(&state.config, &headers)?;
    state.collections.notices.requeue(id).await?;
    Ok(Json(RequeueResponse { requeued: true }))
}

/// Drain the outbox on demand instead of waiting for the next worker tick.
pub async fn dispatch_notices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<DispatchSummary>> {
    require_operator(&state.config, &headers)?;
    let summary = state.collections.notices.process_pending(50).await?;
    Ok(Json(summary))
}

// =============================================================================
// Audit & Invariants
// =============================================================================

pub async fn entity_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entity_id): Path<Uuid>,
) -> ApiResult<Json<Vec<AuditRecord>>> {
    require_operator(&state.config, &headers)?;
    let records = state.collections.audit.for_entity(entity_id).await?;
    Ok(Json(records))
}

pub async fn run_invariants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<InvariantCheckSummary>> {
    require_operator(&state.config, &headers)?;
    let summary = state.collections.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

pub async fn run_invariant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<InvariantViolation>>> {
    require_operator(&state.config, &headers)?;
    let violations = state.collections.invariants.run_check(&name).await?;
    Ok(Json(violations))
}
