//! Collection case converter.
//!
//! Once a dunning case has exhausted level 3 without payment it is converted
//! into a collection case for handoff to an external agency. Conversion
//! validates the fixed checklist of legally/operationally required debtor
//! fields and computes a completeness snapshot; incomplete cases are created
//! but held (not exportable) until operators supply the missing data and
//! re-trigger validation. Conversion is idempotent: re-running it refreshes
//! the snapshot on the existing case, never creates a duplicate.

use serde::Serialize;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use tessera_shared::{CasePriority, CollectionStatus, DunningStatus};

use crate::audit::{AuditEntity, AuditEntry, AuditLogger};
use crate::dunning::{Actor, MAX_ESCALATION_LEVEL};
use crate::error::{CollectionsError, CollectionsResult};

/// The fixed checklist, in reporting order. The agency contract requires
/// all eight before a case may be exported.
pub const REQUIRED_FIELDS: [&str; 8] = [
    "legal_name",
    "address",
    "date_of_birth",
    "contact_email",
    "subscription_reference",
    "invoice_reference",
    "amount_breakdown",
    "accepted_terms_reference",
];

/// Completeness as a rounded percentage of present required fields.
pub fn completeness_percentage(missing_count: usize) -> i32 {
    let total = REQUIRED_FIELDS.len();
    let present = total.saturating_sub(missing_count);
    ((present as f64 / total as f64) * 100.0).round() as i32
}

/// Handling priority derived from the amount owed.
pub fn priority_for_amount(total_cents: i64) -> CasePriority {
    match total_cents {
        t if t >= 100_000 => CasePriority::Urgent,
        t if t >= 50_000 => CasePriority::High,
        t if t >= 15_000 => CasePriority::Normal,
        _ => CasePriority::Low,
    }
}

/// Debtor data gathered for checklist validation.
#[derive(Debug, Clone, Default)]
pub struct DebtorChecklist {
    pub legal_name: Option<String>,
    pub address: Option<String>,
    pub date_of_birth: Option<Date>,
    pub contact_email: Option<String>,
    pub terms_accepted_at: Option<OffsetDateTime>,
    pub subscription_reference: Option<String>,
    pub invoice_reference: Option<String>,
    pub total_cents: i64,
}

impl DebtorChecklist {
    /// Missing required fields, in checklist order.
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();

        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();

        if blank(&self.legal_name) {
            missing.push("legal_name".to_string());
        }
        if blank(&self.address) {
            missing.push("address".to_string());
        }
        if self.date_of_birth.is_none() {
            missing.push("date_of_birth".to_string());
        }
        // A contact address without '@' is as useless to the agency as none.
        if !self
            .contact_email
            .as_deref()
            .map(|e| e.contains('@'))
            .unwrap_or(false)
        {
            missing.push("contact_email".to_string());
        }
        if blank(&self.subscription_reference) {
            missing.push("subscription_reference".to_string());
        }
        if blank(&self.invoice_reference) {
            missing.push("invoice_reference".to_string());
        }
        if self.total_cents <= 0 {
            missing.push("amount_breakdown".to_string());
        }
        if self.terms_accepted_at.is_none() {
            missing.push("accepted_terms_reference".to_string());
        }

        missing
    }
}

/// A collection case as stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CollectionCase {
    pub id: Uuid,
    pub dunning_case_id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub principal_cents: i64,
    pub late_fee_cents: i64,
    pub interest_cents: i64,
    pub total_cents: i64,
    pub data_complete: bool,
    pub missing_fields: Vec<String>,
    pub completeness_pct: i32,
    pub status: CollectionStatus,
    pub priority: CasePriority,
    pub forwarded_at: Option<OffsetDateTime>,
    pub agency_name: Option<String>,
    pub agency_contact: Option<String>,
    pub reference_number: Option<String>,
    pub export_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const SELECT_COLLECTION_CASE: &str = r#"
    SELECT id, dunning_case_id, subscription_id, user_id, principal_cents,
           late_fee_cents, interest_cents, total_cents, data_complete,
           missing_fields, completeness_pct, status, priority, forwarded_at,
           agency_name, agency_contact, reference_number, export_id,
           created_at, updated_at
    FROM collection_cases
"#;

#[derive(Debug, sqlx::FromRow)]
struct ConversionSource {
    subscription_id: Uuid,
    user_id: Uuid,
    escalation_level: i16,
    principal_cents: i64,
    late_fee_cents: i64,
    interest_cents: i64,
    total_cents: i64,
    status: DunningStatus,
    legal_name: Option<String>,
    address: Option<String>,
    date_of_birth: Option<Date>,
    email: Option<String>,
    terms_accepted_at: Option<OffsetDateTime>,
    processor_subscription_id: Option<String>,
    invoice_reference: Option<String>,
}

#[derive(Clone)]
pub struct CaseConverter {
    pool: PgPool,
    audit: AuditLogger,
}

impl CaseConverter {
    pub fn new(pool: PgPool) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Convert a level-3 dunning case into a collection case, or refresh the
    /// completeness snapshot of the existing one.
    pub async fn convert(
        &self,
        dunning_case_id: Uuid,
        actor: &Actor,
    ) -> CollectionsResult<CollectionCase> {
        let mut tx = self.pool.begin().await?;

        // Lock the dunning case so conversion serializes with escalation,
        // payment and a concurrent conversion of the same case.
        let source = sqlx::query_as::<_, ConversionSource>(
            r#"
            SELECT c.subscription_id, c.user_id, c.escalation_level,
                   c.principal_cents, c.late_fee_cents, c.interest_cents,
                   c.total_cents, c.status,
                   u.legal_name, u.address, u.date_of_birth, u.email,
                   u.terms_accepted_at,
                   s.processor_subscription_id,
                   (
                       SELECT r.payment_intent_id
                       FROM payment_retry_records r
                       WHERE r.subscription_id = c.subscription_id
                         AND r.payment_intent_id IS NOT NULL
                       ORDER BY r.attempt_number DESC
                       LIMIT 1
                   ) AS invoice_reference
            FROM dunning_cases c
            JOIN users u ON u.id = c.user_id
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE c.id = $1
            FOR UPDATE OF c
            "#,
        )
        .bind(dunning_case_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CollectionsError::CaseNotFound(dunning_case_id))?;

        if source.status != DunningStatus::Open
            || source.escalation_level < MAX_ESCALATION_LEVEL
        {
            return Err(CollectionsError::InvalidStateTransition {
                state: format!("{} at level {}", source.status, source.escalation_level),
                action: "convert_to_collection".into(),
            });
        }

        let checklist = DebtorChecklist {
            legal_name: source.legal_name,
            address: source.address,
            date_of_birth: source.date_of_birth,
            contact_email: source.email,
            terms_accepted_at: source.terms_accepted_at,
            subscription_reference: source.processor_subscription_id,
            invoice_reference: source.invoice_reference,
            total_cents: source.total_cents,
        };

        let missing = checklist.missing_fields();
        let completeness = completeness_percentage(missing.len());
        let data_complete = missing.is_empty();
        let priority = priority_for_amount(source.total_cents);

        // Upsert keyed on dunning_case_id; the DO UPDATE guard leaves
        // forwarded cases untouched.
        let case = sqlx::query_as::<_, CollectionCase>(&format!(
            r#"
            INSERT INTO collection_cases (
                dunning_case_id, subscription_id, user_id,
                principal_cents, late_fee_cents, interest_cents, total_cents,
                data_complete, missing_fields, completeness_pct, priority
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (dunning_case_id) DO UPDATE SET
                principal_cents = EXCLUDED.principal_cents,
                late_fee_cents = EXCLUDED.late_fee_cents,
                interest_cents = EXCLUDED.interest_cents,
                total_cents = EXCLUDED.total_cents,
                data_complete = EXCLUDED.data_complete,
                missing_fields = EXCLUDED.missing_fields,
                completeness_pct = EXCLUDED.completeness_pct,
                updated_at = NOW()
            WHERE collection_cases.status = 'open'
            RETURNING {columns}
            "#,
            columns = COLLECTION_CASE_COLUMNS,
        ))
        .bind(dunning_case_id)
        .bind(source.subscription_id)
        .bind(source.user_id)
        .bind(source.principal_cents)
        .bind(source.late_fee_cents)
        .bind(source.interest_cents)
        .bind(source.total_cents)
        .bind(data_complete)
        .bind(&missing)
        .bind(completeness)
        .bind(priority)
        .fetch_optional(&mut *tx)
        .await?;

        let case = match case {
            Some(case) => case,
            None => {
                // Upsert skipped: a collection case exists and is no longer
                // open. Refreshing a forwarded case would silently mutate a
                // legally meaningful record.
                return Err(CollectionsError::InvalidStateTransition {
                    state: "forwarded".into(),
                    action: "convert_to_collection".into(),
                });
            }
        };

        // The dunning case stays open for payment but leaves the automatic
        // escalation path; otherwise every scan tick would re-return it and
        // re-run the conversion.
        sqlx::query(
            r#"
            UPDATE dunning_cases
            SET next_action_at = NULL, updated_at = NOW()
            WHERE id = $1 AND next_action_at IS NOT NULL
            "#,
        )
        .bind(dunning_case_id)
        .execute(&mut *tx)
        .await?;

        AuditLogger::log_in_tx(
            &mut tx,
            AuditEntry::new(AuditEntity::CollectionCase, case.id, "conversion_validated")
                .actor(actor.actor_type)
                .actor_id(actor.actor_id.clone().unwrap_or_default())
                .detail(serde_json::json!({
                    "dunning_case_id": dunning_case_id,
                    "total_cents": case.total_cents,
                    "completeness_pct": completeness,
                    "missing_fields": missing,
                    "priority": priority,
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            collection_case_id = %case.id,
            dunning_case_id = %dunning_case_id,
            completeness_pct = completeness,
            data_complete = data_complete,
            "Collection case conversion complete"
        );

        Ok(case)
    }

    /// Re-run the checklist after an operator supplied missing data.
    pub async fn revalidate(
        &self,
        collection_case_id: Uuid,
        actor: &Actor,
    ) -> CollectionsResult<CollectionCase> {
        let case = self.get(collection_case_id).await?;

        if case.status != CollectionStatus::Open {
            return Err(CollectionsError::InvalidStateTransition {
                state: case.status.to_string(),
                action: "revalidate".into(),
            });
        }

        self.convert(case.dunning_case_id, actor).await
    }

    pub async fn get(&self, collection_case_id: Uuid) -> CollectionsResult<CollectionCase> {
        let case = sqlx::query_as::<_, CollectionCase>(&format!(
            "{SELECT_COLLECTION_CASE} WHERE id = $1"
        ))
        .bind(collection_case_id)
        .fetch_optional(&self.pool)
        .await?;

        case.ok_or(CollectionsError::CollectionCaseNotFound(collection_case_id))
    }

    /// Set or replace the agency's reference number for a case.
    pub async fn update_reference_number(
        &self,
        collection_case_id: Uuid,
        reference: &str,
        actor: &Actor,
    ) -> CollectionsResult<CollectionCase> {
        let previous = self.get(collection_case_id).await?;

        let case = sqlx::query_as::<_, CollectionCase>(&format!(
            r#"
            UPDATE collection_cases
            SET reference_number = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {COLLECTION_CASE_COLUMNS}
            "#
        ))
        .bind(collection_case_id)
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .log(
                AuditEntry::new(AuditEntity::CollectionCase, collection_case_id, "reference_updated")
                    .actor(actor.actor_type)
                    .actor_id(actor.actor_id.clone().unwrap_or_default())
                    .detail(serde_json::json!({
                        "previous": previous.reference_number,
                        "reference": reference,
                    })),
            )
            .await?;

        Ok(case)
    }

    /// Reassign a forwarded case to a different agency.
    ///
    /// Never a silent overwrite: the previous assignment is preserved in the
    /// audit trail.
    pub async fn reassign_agency(
        &self,
        collection_case_id: Uuid,
        agency_name: &str,
        agency_contact: Option<&str>,
        actor: &Actor,
    ) -> CollectionsResult<CollectionCase> {
        let previous = self.get(collection_case_id).await?;

        if previous.status != CollectionStatus::Forwarded {
            return Err(CollectionsError::InvalidStateTransition {
                state: previous.status.to_string(),
                action: "reassign_agency".into(),
            });
        }

        let case = sqlx::query_as::<_, CollectionCase>(&format!(
            r#"
            UPDATE collection_cases
            SET agency_name = $2, agency_contact = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'forwarded'
            RETURNING {COLLECTION_CASE_COLUMNS}
            "#
        ))
        .bind(collection_case_id)
        .bind(agency_name)
        .bind(agency_contact)
        .fetch_one(&self.pool)
        .await?;

        self.audit
            .log(
                AuditEntry::new(AuditEntity::CollectionCase, collection_case_id, "agency_reassigned")
                    .actor(actor.actor_type)
                    .actor_id(actor.actor_id.clone().unwrap_or_default())
                    .detail(serde_json::json!({
                        "previous_agency": previous.agency_name,
                        "agency": agency_name,
                    })),
            )
            .await?;

        Ok(case)
    }
}

pub(crate) const COLLECTION_CASE_COLUMNS: &str =
    "id, dunning_case_id, subscription_id, user_id, principal_cents, \
     late_fee_cents, interest_cents, total_cents, data_complete, \
     missing_fields, completeness_pct, status, priority, forwarded_at, \
     agency_name, agency_contact, reference_number, export_id, \
     created_at, updated_at";

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_checklist() -> DebtorChecklist {
        DebtorChecklist {
            legal_name: Some("Ada Lovelace".into()),
            address: Some("12 Analytical Lane, London".into()),
            date_of_birth: Date::from_calendar_date(1990, time::Month::May, 4).ok(),
            contact_email: Some("ada@example.com".into()),
            terms_accepted_at: Some(OffsetDateTime::now_utc()),
            subscription_reference: Some("sub_123".into()),
            invoice_reference: Some("pi_456".into()),
            total_cents: 15_000,
        }
    }

    #[test]
    fn test_complete_checklist_has_no_missing_fields() {
        let missing = complete_checklist().missing_fields();
        assert!(missing.is_empty());
        assert_eq!(completeness_percentage(missing.len()), 100);
    }

    #[test]
    fn test_two_missing_fields_is_75_percent() {
        let mut checklist = complete_checklist();
        checklist.date_of_birth = None;
        checklist.address = None;

        let missing = checklist.missing_fields();
        assert_eq!(missing, vec!["address".to_string(), "date_of_birth".to_string()]);
        assert_eq!(completeness_percentage(missing.len()), 75);
    }

    #[test]
    fn test_completeness_is_monotonically_decreasing() {
        let mut previous = 101;
        for missing in 0..=REQUIRED_FIELDS.len() {
            let pct = completeness_percentage(missing);
            assert!(pct < previous, "completeness must fall as fields go missing");
            previous = pct;
        }
        assert_eq!(completeness_percentage(REQUIRED_FIELDS.len()), 0);
        // More reported missing than fields exist saturates at zero.
        assert_eq!(completeness_percentage(REQUIRED_FIELDS.len() + 3), 0);
    }

    #[test]
    fn test_email_without_at_sign_counts_as_missing() {
        let mut checklist = complete_checklist();
        checklist.contact_email = Some("not-an-email".into());
        assert!(checklist
            .missing_fields()
            .contains(&"contact_email".to_string()));
    }

    #[test]
    fn test_whitespace_only_fields_count_as_missing() {
        let mut checklist = complete_checklist();
        checklist.legal_name = Some("   ".into());
        assert!(checklist.missing_fields().contains(&"legal_name".to_string()));
    }

    #[test]
    fn test_priority_tiers() {
        assert_eq!(priority_for_amount(5_000), CasePriority::Low);
        assert_eq!(priority_for_amount(15_000), CasePriority::Normal);
        assert_eq!(priority_for_amount(50_000), CasePriority::High);
        assert_eq!(priority_for_amount(250_000), CasePriority::Urgent);
    }
}
