//! Recovery engine invariants.
//!
//! Runnable consistency checks over the recovery tables. Each invariant is a
//! real SQL query; checks only read, never write, so they are safe to run
//! after any mutation or webhook replay. Violations carry enough context to
//! debug the affected rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CollectionsError, CollectionsResult};

/// Result of a single failed invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Affected entity ids.
    pub entity_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money amounts or case lifecycle are wrong.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of an invariant sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub const CHECK_NAMES: [&str; 6] = [
    "single_open_case_per_subscription",
    "case_totals_add_up",
    "notice_count_matches_level",
    "forwarded_cases_fully_recorded",
    "export_case_links_consistent",
    "terminal_cases_have_closed_at",
];

#[derive(Debug, sqlx::FromRow)]
struct DuplicateOpenCaseRow {
    subscription_id: Uuid,
    case_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BadTotalRow {
    id: Uuid,
    principal_cents: i64,
    late_fee_cents: i64,
    interest_cents: i64,
    total_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NoticeCountRow {
    id: Uuid,
    escalation_level: i16,
    notice_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ForwardedGapRow {
    id: Uuid,
    status: String,
    forwarded_at: Option<OffsetDateTime>,
    agency_name: Option<String>,
    export_id: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct ExportLinkRow {
    export_id: Uuid,
    case_id: Uuid,
    linked_export_id: Option<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingClosedAtRow {
    id: Uuid,
    status: String,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and return a summary.
    pub async fn run_all_checks(&self) -> CollectionsResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_open_case_per_subscription().await?);
        violations.extend(self.check_case_totals_add_up().await?);
        violations.extend(self.check_notice_count_matches_level().await?);
        violations.extend(self.check_forwarded_cases_fully_recorded().await?);
        violations.extend(self.check_export_case_links_consistent().await?);
        violations.extend(self.check_terminal_cases_have_closed_at().await?);

        let checks_run = CHECK_NAMES.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single named check.
    pub async fn run_check(&self, name: &str) -> CollectionsResult<Vec<InvariantViolation>> {
        match name {
            "single_open_case_per_subscription" => {
                self.check_single_open_case_per_subscription().await
            }
            "case_totals_add_up" => self.check_case_totals_add_up().await,
            "notice_count_matches_level" => self.check_notice_count_matches_level().await,
            "forwarded_cases_fully_recorded" => self.check_forwarded_cases_fully_recorded().await,
            "export_case_links_consistent" => self.check_export_case_links_consistent().await,
            "terminal_cases_have_closed_at" => self.check_terminal_cases_have_closed_at().await,
            _ => Err(CollectionsError::Internal(format!(
                "unknown invariant check: {name}"
            ))),
        }
    }

    /// At most one open dunning case per subscription.
    ///
    /// Two open cases would double-fee the same overdue balance. The partial
    /// unique index enforces this; a violation here means the index is gone.
    async fn check_single_open_case_per_subscription(
        &self,
    ) -> CollectionsResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateOpenCaseRow> = sqlx::query_as(
            r#"
            SELECT subscription_id, COUNT(*) as case_count
            FROM dunning_cases
            WHERE status = 'open'
            GROUP BY subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_case_per_subscription".to_string(),
                entity_ids: vec![row.subscription_id],
                description: format!(
                    "Subscription has {} open dunning cases (expected at most 1)",
                    row.case_count
                ),
                context: serde_json::json!({ "case_count": row.case_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// total_cents equals principal + late fees + interest on every case,
    /// dunning and collection alike.
    async fn check_case_totals_add_up(&self) -> CollectionsResult<Vec<InvariantViolation>> {
        let rows: Vec<BadTotalRow> = sqlx::query_as(
            r#"
            SELECT id, principal_cents, late_fee_cents, interest_cents, total_cents
            FROM dunning_cases
            WHERE total_cents <> principal_cents + late_fee_cents + interest_cents
            UNION ALL
            SELECT id, principal_cents, late_fee_cents, interest_cents, total_cents
            FROM collection_cases
            WHERE total_cents <> principal_cents + late_fee_cents + interest_cents
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "case_totals_add_up".to_string(),
                entity_ids: vec![row.id],
                description: "Case total does not equal principal + fees + interest".to_string(),
                context: serde_json::json!({
                    "principal_cents": row.principal_cents,
                    "late_fee_cents": row.late_fee_cents,
                    "interest_cents": row.interest_cents,
                    "total_cents": row.total_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// An open case at level N has exactly N notices enqueued.
    async fn check_notice_count_matches_level(
        &self,
    ) -> CollectionsResult<Vec<InvariantViolation>> {
        let rows: Vec<NoticeCountRow> = sqlx::query_as(
            r#"
            SELECT c.id, c.escalation_level, COUNT(n.id) as notice_count
            FROM dunning_cases c
            LEFT JOIN dunning_notices n ON n.case_id = c.id
            WHERE c.status = 'open'
            GROUP BY c.id, c.escalation_level
            HAVING COUNT(n.id) <> c.escalation_level
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "notice_count_matches_level".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Case at level {} has {} notices (expected {})",
                    row.escalation_level, row.notice_count, row.escalation_level
                ),
                context: serde_json::json!({
                    "escalation_level": row.escalation_level,
                    "notice_count": row.notice_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A forwarded collection case carries forwarded_at, agency_name and an
    /// export id; an open one carries none of them.
    async fn check_forwarded_cases_fully_recorded(
        &self,
    ) -> CollectionsResult<Vec<InvariantViolation>> {
        let rows: Vec<ForwardedGapRow> = sqlx::query_as(
            r#"
            SELECT id, status, forwarded_at, agency_name, export_id
            FROM collection_cases
            WHERE (status <> 'open'
                   AND (forwarded_at IS NULL OR agency_name IS NULL OR export_id IS NULL))
               OR (status = 'open'
                   AND (forwarded_at IS NOT NULL OR agency_name IS NOT NULL OR export_id IS NOT NULL))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "forwarded_cases_fully_recorded".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Collection case in status '{}' has inconsistent forwarding fields",
                    row.status
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "forwarded_at": row.forwarded_at.map(|t| t.to_string()),
                    "agency_name": row.agency_name,
                    "export_id": row.export_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Every case id listed in an export points back at that export.
    async fn check_export_case_links_consistent(
        &self,
    ) -> CollectionsResult<Vec<InvariantViolation>> {
        let rows: Vec<ExportLinkRow> = sqlx::query_as(
            r#"
            SELECT e.id as export_id, cid as case_id, c.export_id as linked_export_id
            FROM collection_exports e
            CROSS JOIN UNNEST(e.case_ids) as cid
            LEFT JOIN collection_cases c ON c.id = cid
            WHERE c.export_id IS DISTINCT FROM e.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "export_case_links_consistent".to_string(),
                entity_ids: vec![row.export_id, row.case_id],
                description: "Export lists a case that does not link back to it".to_string(),
                context: serde_json::json!({
                    "export_id": row.export_id,
                    "case_id": row.case_id,
                    "linked_export_id": row.linked_export_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Terminal dunning cases carry a close timestamp.
    async fn check_terminal_cases_have_closed_at(
        &self,
    ) -> CollectionsResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingClosedAtRow> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM dunning_cases
            WHERE status IN ('paid', 'cancelled') AND closed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "terminal_cases_have_closed_at".to_string(),
                entity_ids: vec![row.id],
                description: format!("Case closed as '{}' without a closed_at timestamp", row.status),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_names_are_unique() {
        let mut names = CHECK_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CHECK_NAMES.len());
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }
}
