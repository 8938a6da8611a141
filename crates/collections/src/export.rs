//! Collection export batcher.
//!
//! Bundles complete, open collection cases into an export handed to an
//! external agency. An export is all-or-nothing: every case in the batch is
//! validated and transitioned in one transaction, and a single ineligible
//! case rejects the whole batch with nothing forwarded. Export records are
//! immutable once written; the only later mutation is the one-shot receipt
//! confirmation.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tessera_shared::CollectionStatus;

use crate::audit::{AuditEntity, AuditEntry, AuditLogger};
use crate::convert::{CollectionCase, COLLECTION_CASE_COLUMNS};
use crate::dunning::Actor;
use crate::error::{CollectionsError, CollectionsResult};

/// An export batch as stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CollectionExport {
    pub id: Uuid,
    pub agency_name: String,
    pub exported_by: String,
    pub notes: Option<String>,
    pub case_ids: Vec<Uuid>,
    pub total_cents: i64,
    pub created_at: OffsetDateTime,
    pub receipt_confirmed_at: Option<OffsetDateTime>,
}

/// Input for a new export batch.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub agency_name: String,
    pub agency_contact: Option<String>,
    pub notes: Option<String>,
    pub case_ids: Vec<Uuid>,
}

/// Duplicate ids removed, order normalized. Lock acquisition follows this
/// order, so two overlapping exports over intersecting sets cannot deadlock.
pub fn normalize_case_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = ids.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Batch eligibility check: every requested case must exist, be open, and
/// be data-complete. A single ineligible case rejects the whole batch.
pub fn validate_batch(requested: &[Uuid], cases: &[CollectionCase]) -> CollectionsResult<()> {
    if cases.len() != requested.len() {
        let found: Vec<Uuid> = cases.iter().map(|c| c.id).collect();
        let missing = requested
            .iter()
            .find(|id| !found.contains(id))
            .copied()
            .unwrap_or_default();
        return Err(CollectionsError::CollectionCaseNotFound(missing));
    }

    for case in cases {
        if case.status != CollectionStatus::Open {
            return Err(CollectionsError::InvalidStateTransition {
                state: format!("case {} is {}", case.id, case.status),
                action: "export".into(),
            });
        }
        if !case.data_complete {
            return Err(CollectionsError::IncompleteData {
                missing: case
                    .missing_fields
                    .iter()
                    .map(|f| format!("{}: {f}", case.id))
                    .collect(),
            });
        }
    }

    Ok(())
}

const SELECT_EXPORT: &str = r#"
    SELECT id, agency_name, exported_by, notes, case_ids, total_cents,
           created_at, receipt_confirmed_at
    FROM collection_exports
"#;

#[derive(Clone)]
pub struct ExportBatcher {
    pool: PgPool,
    audit: AuditLogger,
}

impl ExportBatcher {
    pub fn new(pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Create an export batch and forward every case in it.
    ///
    /// All cases are locked up front; a case that is missing, not open, or
    /// not data-complete fails the entire batch. Every forwarded case gets
    /// the same `forwarded_at` timestamp and the export's id.
    pub async fn create_batch(
        &self,
        request: ExportRequest,
        actor: &Actor,
    ) -> CollectionsResult<CollectionExport> {
        let case_ids = normalize_case_ids(&request.case_ids);
        if case_ids.is_empty() {
            return Err(CollectionsError::IncompleteData {
                missing: vec!["case_ids".to_string()],
            });
        }
        if request.agency_name.trim().is_empty() {
            return Err(CollectionsError::IncompleteData {
                missing: vec!["agency_name".to_string()],
            });
        }

        let mut tx = self.pool.begin().await?;

        let cases = sqlx::query_as::<_, CollectionCase>(&format!(
            r#"
            SELECT {COLLECTION_CASE_COLUMNS}
            FROM collection_cases
            WHERE id = ANY($1)
            ORDER BY id ASC
            FOR UPDATE
            "#
        ))
        .bind(&case_ids)
        .fetch_all(&mut *tx)
        .await?;

        validate_batch(&case_ids, &cases)?;

        let total_cents: i64 = cases.iter().map(|c| c.total_cents).sum();

        let export = sqlx::query_as::<_, CollectionExport>(&format!(
            r#"
            INSERT INTO collection_exports (agency_name, exported_by, notes, case_ids, total_cents)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {EXPORT_COLUMNS}
            "#
        ))
        .bind(&request.agency_name)
        .bind(actor.actor_id.as_deref().unwrap_or("system"))
        .bind(&request.notes)
        .bind(&case_ids)
        .bind(total_cents)
        .fetch_one(&mut *tx)
        .await?;

        // One timestamp for the whole batch.
        sqlx::query(
            r#"
            UPDATE collection_cases
            SET status = 'forwarded',
                forwarded_at = $2,
                agency_name = $3,
                agency_contact = $4,
                export_id = $5,
                updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(&case_ids)
        .bind(export.created_at)
        .bind(&request.agency_name)
        .bind(&request.agency_contact)
        .bind(export.id)
        .execute(&mut *tx)
        .await?;

        AuditLogger::log_in_tx(
            &mut tx,
            AuditEntry::new(AuditEntity::CollectionExport, export.id, "export_created")
                .actor(actor.actor_type)
                .actor_id(actor.actor_id.clone().unwrap_or_default())
                .detail(serde_json::json!({
                    "agency_name": request.agency_name,
                    "case_count": case_ids.len(),
                    "total_cents": total_cents,
                })),
        )
        .await?;

        for case in &cases {
            AuditLogger::log_in_tx(
                &mut tx,
                AuditEntry::new(AuditEntity::CollectionCase, case.id, "forwarded")
                    .actor(actor.actor_type)
                    .actor_id(actor.actor_id.clone().unwrap_or_default())
                    .detail(serde_json::json!({
                        "export_id": export.id,
                        "agency_name": request.agency_name,
                        "total_cents": case.total_cents,
                    })),
            )
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            export_id = %export.id,
            agency = %export.agency_name,
            case_count = case_ids.len(),
            total_cents = total_cents,
            "Collection export created"
        );

        Ok(export)
    }

    /// Record the agency's receipt confirmation. Settable exactly once.
    pub async fn confirm_receipt(
        &self,
        export_id: Uuid,
        actor: &Actor,
    ) -> CollectionsResult<CollectionExport> {
        let confirmed = sqlx::query_as::<_, CollectionExport>(&format!(
            r#"
            UPDATE collection_exports
            SET receipt_confirmed_at = NOW()
            WHERE id = $1 AND receipt_confirmed_at IS NULL
            RETURNING {EXPORT_COLUMNS}
            "#
        ))
        .bind(export_id)
        .fetch_optional(&self.pool)
        .await?;

        let export = match confirmed {
            Some(export) => export,
            None => {
                // Distinguish a replay from a bad id.
                self.get(export_id).await?;
                return Err(CollectionsError::AlreadyProcessed(format!(
                    "receipt for export {export_id} already confirmed"
                )));
            }
        };

        self.audit
            .log(
                AuditEntry::new(AuditEntity::CollectionExport, export_id, "receipt_confirmed")
                    .actor(actor.actor_type)
                    .actor_id(actor.actor_id.clone().unwrap_or_default()),
            )
            .await?;

        tracing::info!(export_id = %export_id, "Export receipt confirmed");
        Ok(export)
    }

    pub async fn get(&self, export_id: Uuid) -> CollectionsResult<CollectionExport> {
        let export = sqlx::query_as::<_, CollectionExport>(&format!(
            "{SELECT_EXPORT} WHERE id = $1"
        ))
        .bind(export_id)
        .fetch_optional(&self.pool)
        .await?;

        export.ok_or(CollectionsError::ExportNotFound(export_id))
    }

    /// Recent exports, newest first.
    pub async fn list(&self, limit: i64) -> CollectionsResult<Vec<CollectionExport>> {
        let exports = sqlx::query_as::<_, CollectionExport>(&format!(
            "{SELECT_EXPORT} ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(exports)
    }
}

const EXPORT_COLUMNS: &str =
    "id, agency_name, exported_by, notes, case_ids, total_cents, created_at, \
     receipt_confirmed_at";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_removes_duplicates_and_orders() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let normalized = normalize_case_ids(&[b, a, b, a, b]);

        assert_eq!(normalized.len(), 2);
        assert!(normalized.windows(2).all(|w| w[0] < w[1]));
        assert!(normalized.contains(&a));
        assert!(normalized.contains(&b));
    }

    #[test]
    fn test_normalize_empty_stays_empty() {
        assert!(normalize_case_ids(&[]).is_empty());
    }

    fn exportable_case(id: Uuid) -> CollectionCase {
        let now = OffsetDateTime::now_utc();
        CollectionCase {
            id,
            dunning_case_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            principal_cents: 10_000,
            late_fee_cents: 5_000,
            interest_cents: 0,
            total_cents: 15_000,
            data_complete: true,
            missing_fields: Vec::new(),
            completeness_pct: 100,
            status: CollectionStatus::Open,
            priority: tessera_shared::CasePriority::Normal,
            forwarded_at: None,
            agency_name: None,
            agency_contact: None,
            reference_number: None,
            export_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_batch_with_all_eligible_cases_passes() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let cases: Vec<CollectionCase> = ids.iter().map(|id| exportable_case(*id)).collect();
        assert!(validate_batch(&ids, &cases).is_ok());
    }

    // One bad case rejects the whole batch; nothing is forwarded.
    #[test]
    fn test_one_forwarded_case_rejects_batch() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut cases: Vec<CollectionCase> = ids.iter().map(|id| exportable_case(*id)).collect();
        cases[1].status = CollectionStatus::Forwarded;

        let err = validate_batch(&ids, &cases).unwrap_err();
        assert_eq!(err.code(), "invalid_state_transition");
    }

    #[test]
    fn test_one_incomplete_case_rejects_batch() {
        let ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let mut cases: Vec<CollectionCase> = ids.iter().map(|id| exportable_case(*id)).collect();
        cases[0].data_complete = false;
        cases[0].missing_fields = vec!["date_of_birth".to_string()];

        let err = validate_batch(&ids, &cases).unwrap_err();
        assert_eq!(err.code(), "incomplete_data");
    }

    #[test]
    fn test_unknown_case_id_rejects_batch() {
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        let mut requested = vec![known, unknown];
        requested.sort();

        let err = validate_batch(&requested, &[exportable_case(known)]).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
