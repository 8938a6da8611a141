//! Dunning case state machine.
//!
//! Owns the lifecycle of an overdue subscription: level 0 (case opened, no
//! notice out) through levels 1-3, then terminal `paid` or `cancelled`.
//! Every mutating operation locks the case row first, so a duplicate webhook
//! delivery, a scheduler tick and an operator action racing on the same case
//! serialize instead of double-applying fees or skipping a level.
//!
//! `total_cents` is recomputed as principal + late fees + interest at every
//! mutation point and never trusted from caller input.

use std::sync::Arc;

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tessera_shared::{ActorType, DunningStatus};

use crate::audit::{AuditEntity, AuditEntry, AuditLogger};
use crate::error::{CollectionsError, CollectionsResult};
use crate::fees::FeeSchedule;
use crate::interest::{InterestStrategy, NoInterest};

pub const MAX_ESCALATION_LEVEL: i16 = 3;

/// A dunning case as stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DunningCase {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub escalation_level: i16,
    pub principal_cents: i64,
    pub late_fee_cents: i64,
    pub interest_cents: i64,
    pub total_cents: i64,
    pub amount_paid_cents: i64,
    pub status: DunningStatus,
    pub next_action_at: Option<OffsetDateTime>,
    pub closed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl DunningCase {
    /// Outstanding balance after partial payments.
    pub fn balance_cents(&self) -> i64 {
        (self.total_cents - self.amount_paid_cents).max(0)
    }
}

/// Who is asking for a transition; carried into the audit trail.
#[derive(Debug, Clone)]
pub struct Actor {
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self { actor_type: ActorType::System, actor_id: None }
    }

    pub fn scheduler() -> Self {
        Self { actor_type: ActorType::Scheduler, actor_id: None }
    }

    pub fn processor(event_id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Processor,
            actor_id: Some(event_id.into()),
        }
    }

    pub fn operator(email: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Operator,
            actor_id: Some(email.into()),
        }
    }
}

/// Result of an `escalate` call.
#[derive(Debug)]
pub enum EscalationOutcome {
    /// Level advanced by exactly one; a notice was enqueued.
    Escalated(DunningCase),
    /// The case already sits at level 3 past its deadline; it must be handed
    /// to the collection converter instead of advancing further.
    FinalLevelReached(DunningCase),
}

/// Pure legality check for an escalation, shared by the state machine and
/// its tests.
///
/// A NULL deadline means the case has left the automatic escalation path
/// (it was converted to collection, or closed and reopened); only a forced
/// operator action may move it.
pub fn escalation_allowed(
    status: DunningStatus,
    next_action_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
    force: bool,
) -> Result<(), &'static str> {
    if status.is_terminal() {
        return Err("case is closed");
    }
    if force {
        return Ok(());
    }
    match next_action_at {
        None => Err("no automatic action scheduled"),
        Some(due) if due <= now => Ok(()),
        Some(_) => Err("deadline has not elapsed"),
    }
}

/// Deadline stamped on a freshly opened case. A new case is due immediately,
/// so the next scheduler pass issues the first reminder instead of the case
/// sitting invisible to the scan at level 0.
pub fn initial_action_deadline(now: OffsetDateTime) -> OffsetDateTime {
    now
}

/// Pure transition check for settling a case. `Ok(false)` means the case is
/// already paid and the call is an idempotent no-op.
pub fn settlement_allowed(status: DunningStatus) -> Result<bool, &'static str> {
    match status {
        DunningStatus::Paid => Ok(false),
        DunningStatus::Cancelled => Err("cancelled"),
        DunningStatus::Open => Ok(true),
    }
}

#[derive(Clone)]
pub struct DunningService {
    pool: PgPool,
    audit: AuditLogger,
    fees: FeeSchedule,
    interest: Arc<dyn InterestStrategy>,
}

const SELECT_CASE_FOR_UPDATE: &str = r#"
    SELECT id, subscription_id, user_id, escalation_level, principal_cents,
           late_fee_cents, interest_cents, total_cents, amount_paid_cents,
           status, next_action_at, closed_at, created_at, updated_at
    FROM dunning_cases
    WHERE id = $1
    FOR UPDATE
"#;

impl DunningService {
    pub fn new(pool: PgPool, fees: FeeSchedule) -> Self {
        let audit = AuditLogger::new(pool.clone());
        Self {
            pool,
            audit,
            fees,
            interest: Arc::new(NoInterest),
        }
    }

    pub fn with_interest_strategy(mut self, interest: Arc<dyn InterestStrategy>) -> Self {
        self.interest = interest;
        self
    }

    pub fn fee_schedule(&self) -> &FeeSchedule {
        &self.fees
    }

    /// Open a case at level 0, or return the existing open case.
    ///
    /// The partial unique index on (subscription_id) WHERE status = 'open'
    /// makes this safe under concurrent webhook deliveries: at most one open
    /// case per subscription ever exists.
    pub async fn ensure_open_case(
        &self,
        subscription_id: Uuid,
        user_id: Uuid,
        principal_cents: i64,
        actor: &Actor,
    ) -> CollectionsResult<(DunningCase, bool)> {
        let inserted = sqlx::query_as::<_, DunningCase>(
            r#"
            INSERT INTO dunning_cases (
                subscription_id, user_id, principal_cents, total_cents, next_action_at
            )
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (subscription_id) WHERE status = 'open' DO NOTHING
            RETURNING id, subscription_id, user_id, escalation_level, principal_cents,
                      late_fee_cents, interest_cents, total_cents, amount_paid_cents,
                      status, next_action_at, closed_at, created_at, updated_at
            "#,
        )
        .bind(subscription_id)
        .bind(user_id)
        .bind(principal_cents)
        .bind(initial_action_deadline(OffsetDateTime::now_utc()))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(case) = inserted {
            self.audit
                .log(
                    AuditEntry::new(AuditEntity::DunningCase, case.id, "case_opened")
                        .actor(actor.actor_type)
                        .actor_id(actor.actor_id.clone().unwrap_or_default())
                        .detail(serde_json::json!({
                            "subscription_id": subscription_id,
                            "principal_cents": principal_cents,
                        })),
                )
                .await?;

            tracing::info!(
                case_id = %case.id,
                subscription_id = %subscription_id,
                principal_cents = principal_cents,
                "Dunning case opened"
            );
            return Ok((case, true));
        }

        let existing = self
            .find_open_by_subscription(subscription_id)
            .await?
            .ok_or(CollectionsError::ConcurrentModification {
                entity: "dunning_cases",
                id: subscription_id,
            })?;

        Ok((existing, false))
    }

    pub async fn get(&self, case_id: Uuid) -> CollectionsResult<DunningCase> {
        let case = sqlx::query_as::<_, DunningCase>(
            r#"
            SELECT id, subscription_id, user_id, escalation_level, principal_cents,
                   late_fee_cents, interest_cents, total_cents, amount_paid_cents,
                   status, next_action_at, closed_at, created_at, updated_at
            FROM dunning_cases
            WHERE id = $1
            "#,
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;

        case.ok_or(CollectionsError::CaseNotFound(case_id))
    }

    pub async fn find_open_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> CollectionsResult<Option<DunningCase>> {
        let case = sqlx::query_as::<_, DunningCase>(
            r#"
            SELECT id, subscription_id, user_id, escalation_level, principal_cents,
                   late_fee_cents, interest_cents, total_cents, amount_paid_cents,
                   status, next_action_at, closed_at, created_at, updated_at
            FROM dunning_cases
            WHERE subscription_id = $1 AND status = 'open'
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(case)
    }

    /// Advance the case by exactly one escalation level.
    ///
    /// Legal only while the case is open and its deadline has elapsed (or an
    /// operator forces it). Applies the fee for the new level, recomputes the
    /// total, pushes the deadline out, and enqueues the notice for the new
    /// level in the same transaction (outbox; dispatch happens out of band
    /// and never holds the case lock).
    pub async fn escalate(
        &self,
        case_id: Uuid,
        actor: &Actor,
        force: bool,
    ) -> CollectionsResult<EscalationOutcome> {
        let mut tx = self.pool.begin().await?;

        let case = self.lock_case(&mut tx, case_id).await?;
        let now = OffsetDateTime::now_utc();

        escalation_allowed(case.status, case.next_action_at, now, force).map_err(|reason| {
            CollectionsError::InvalidStateTransition {
                state: format!("level {} ({})", case.escalation_level, reason),
                action: "escalate".into(),
            }
        })?;

        if case.escalation_level >= MAX_ESCALATION_LEVEL {
            // Level caps at 3; the caller hands the case to the converter.
            tx.rollback().await?;
            return Ok(EscalationOutcome::FinalLevelReached(case));
        }

        let new_level = case.escalation_level + 1;
        let step = self
            .fees
            .fee_for(new_level)
            .ok_or_else(|| CollectionsError::Internal(format!("no fee step for level {new_level}")))?;

        let late_fee_cents = case.late_fee_cents + step.late_fee_cents;
        let interest_cents = self
            .interest
            .accrued_cents(case.principal_cents, case.created_at);
        let total_cents = case.principal_cents + late_fee_cents + interest_cents;
        let next_action_at = now + Duration::days(step.deadline_days);

        let updated = sqlx::query_as::<_, DunningCase>(
            r#"
            UPDATE dunning_cases
            SET escalation_level = $2,
                late_fee_cents = $3,
                interest_cents = $4,
                total_cents = $5,
                next_action_at = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, subscription_id, user_id, escalation_level, principal_cents,
                      late_fee_cents, interest_cents, total_cents, amount_paid_cents,
                      status, next_action_at, closed_at, created_at, updated_at
            "#,
        )
        .bind(case_id)
        .bind(new_level)
        .bind(late_fee_cents)
        .bind(interest_cents)
        .bind(total_cents)
        .bind(next_action_at)
        .fetch_one(&mut *tx)
        .await?;

        let recipient: String =
            sqlx::query_scalar("SELECT email FROM users WHERE id = $1")
                .bind(case.user_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO dunning_notices (case_id, level, recipient)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(case_id)
        .bind(new_level)
        .bind(&recipient)
        .execute(&mut *tx)
        .await?;

        AuditLogger::log_in_tx(
            &mut tx,
            AuditEntry::new(AuditEntity::DunningCase, case_id, "escalated")
                .actor(actor.actor_type)
                .actor_id(actor.actor_id.clone().unwrap_or_default())
                .detail(serde_json::json!({
                    "from_level": case.escalation_level,
                    "to_level": new_level,
                    "fee_applied_cents": step.late_fee_cents,
                    "late_fee_cents": late_fee_cents,
                    "total_cents": total_cents,
                    "next_action_at": next_action_at.to_string(),
                    "forced": force,
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            case_id = %case_id,
            level = new_level,
            total_cents = total_cents,
            "Dunning case escalated"
        );

        Ok(EscalationOutcome::Escalated(updated))
    }

    /// Close the case as paid. Idempotent: an already-paid case is a no-op.
    pub async fn mark_paid(&self, case_id: Uuid, actor: &Actor) -> CollectionsResult<DunningCase> {
        let mut tx = self.pool.begin().await?;
        let case = self.lock_case(&mut tx, case_id).await?;

        match settlement_allowed(case.status) {
            Ok(false) => {
                tx.rollback().await?;
                return Ok(case);
            }
            Err(state) => {
                return Err(CollectionsError::InvalidStateTransition {
                    state: state.into(),
                    action: "mark_paid".into(),
                });
            }
            Ok(true) => {}
        }

        let updated = self
            .close_case(&mut tx, case_id, DunningStatus::Paid)
            .await?;

        AuditLogger::log_in_tx(
            &mut tx,
            AuditEntry::new(AuditEntity::DunningCase, case_id, "marked_paid")
                .actor(actor.actor_type)
                .actor_id(actor.actor_id.clone().unwrap_or_default())
                .detail(serde_json::json!({
                    "level_at_close": case.escalation_level,
                    "total_cents": case.total_cents,
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(case_id = %case_id, "Dunning case marked paid");
        Ok(updated)
    }

    /// Administrative override closing the case without payment.
    pub async fn cancel(&self, case_id: Uuid, actor: &Actor) -> CollectionsResult<DunningCase> {
        let mut tx = self.pool.begin().await?;
        let case = self.lock_case(&mut tx, case_id).await?;

        match case.status {
            DunningStatus::Cancelled => {
                return Err(CollectionsError::AlreadyProcessed(format!(
                    "case {case_id} already cancelled"
                )));
            }
            DunningStatus::Paid => {
                return Err(CollectionsError::InvalidStateTransition {
                    state: "paid".into(),
                    action: "cancel".into(),
                });
            }
            DunningStatus::Open => {}
        }

        let updated = self
            .close_case(&mut tx, case_id, DunningStatus::Cancelled)
            .await?;

        AuditLogger::log_in_tx(
            &mut tx,
            AuditEntry::new(AuditEntity::DunningCase, case_id, "cancelled")
                .actor(actor.actor_type)
                .actor_id(actor.actor_id.clone().unwrap_or_default())
                .detail(serde_json::json!({
                    "level_at_close": case.escalation_level,
                    "balance_cents": case.balance_cents(),
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(case_id = %case_id, "Dunning case cancelled");
        Ok(updated)
    }

    /// Record a (possibly partial) payment against the case.
    ///
    /// Closes the case as paid once the balance reaches zero.
    pub async fn record_payment(
        &self,
        case_id: Uuid,
        amount_cents: i64,
        actor: &Actor,
    ) -> CollectionsResult<DunningCase> {
        if amount_cents <= 0 {
            return Err(CollectionsError::Internal(
                "payment amount must be positive".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let case = self.lock_case(&mut tx, case_id).await?;

        if case.status.is_terminal() {
            return Err(CollectionsError::InvalidStateTransition {
                state: case.status.to_string(),
                action: "record_payment".into(),
            });
        }

        let amount_paid = case.amount_paid_cents + amount_cents;
        let settles = amount_paid >= case.total_cents;

        let updated = sqlx::query_as::<_, DunningCase>(
            r#"
            UPDATE dunning_cases
            SET amount_paid_cents = $2,
                status = CASE WHEN $3 THEN 'paid' ELSE status END,
                next_action_at = CASE WHEN $3 THEN NULL ELSE next_action_at END,
                closed_at = CASE WHEN $3 THEN NOW() ELSE closed_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, subscription_id, user_id, escalation_level, principal_cents,
                      late_fee_cents, interest_cents, total_cents, amount_paid_cents,
                      status, next_action_at, closed_at, created_at, updated_at
            "#,
        )
        .bind(case_id)
        .bind(amount_paid)
        .bind(settles)
        .fetch_one(&mut *tx)
        .await?;

        AuditLogger::log_in_tx(
            &mut tx,
            AuditEntry::new(AuditEntity::DunningCase, case_id, "payment_recorded")
                .actor(actor.actor_type)
                .actor_id(actor.actor_id.clone().unwrap_or_default())
                .detail(serde_json::json!({
                    "amount_cents": amount_cents,
                    "amount_paid_cents": amount_paid,
                    "settled": settles,
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            case_id = %case_id,
            amount_cents = amount_cents,
            settled = settles,
            "Payment recorded on dunning case"
        );

        Ok(updated)
    }

    /// Ids of open cases whose deadline has elapsed, oldest first.
    ///
    /// The scan itself takes no locks; each returned id goes through
    /// `escalate`, which re-checks the deadline under the row lock. Running
    /// two overlapping scans therefore cannot double-escalate.
    pub async fn scan_due(&self, limit: i64) -> CollectionsResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM dunning_cases
            WHERE status = 'open'
              AND next_action_at IS NOT NULL
              AND next_action_at <= NOW()
            ORDER BY next_action_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Notices for a case in enqueue order (the append-only sub-list that
    /// replaces the legacy first/second/third sent-at columns).
    pub async fn notices(&self, case_id: Uuid) -> CollectionsResult<Vec<crate::notices::NoticeRecord>> {
        crate::notices::notices_for_case(&self.pool, case_id).await
    }

    async fn lock_case(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        case_id: Uuid,
    ) -> CollectionsResult<DunningCase> {
        let case = sqlx::query_as::<_, DunningCase>(SELECT_CASE_FOR_UPDATE)
            .bind(case_id)
            .fetch_optional(&mut **tx)
            .await?;

        case.ok_or(CollectionsError::CaseNotFound(case_id))
    }

    async fn close_case(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        case_id: Uuid,
        status: DunningStatus,
    ) -> CollectionsResult<DunningCase> {
        let updated = sqlx::query_as::<_, DunningCase>(
            r#"
            UPDATE dunning_cases
            SET status = $2,
                next_action_at = NULL,
                closed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, subscription_id, user_id, escalation_level, principal_cents,
                      late_fee_cents, interest_cents, total_cents, amount_paid_cents,
                      status, next_action_at, closed_at, created_at, updated_at
            "#,
        )
        .bind(case_id)
        .bind(status)
        .fetch_one(&mut **tx)
        .await?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_blocked_on_terminal_states() {
        let now = OffsetDateTime::now_utc();
        assert!(escalation_allowed(DunningStatus::Paid, None, now, false).is_err());
        assert!(escalation_allowed(DunningStatus::Cancelled, None, now, false).is_err());
        // Force never overrides a closed case.
        assert!(escalation_allowed(DunningStatus::Paid, None, now, true).is_err());
    }

    #[test]
    fn test_escalation_waits_for_deadline() {
        let now = OffsetDateTime::now_utc();
        let future = Some(now + Duration::days(7));
        let past = Some(now - Duration::hours(1));

        assert!(escalation_allowed(DunningStatus::Open, future, now, false).is_err());
        assert!(escalation_allowed(DunningStatus::Open, past, now, false).is_ok());
        // Operator force bypasses the deadline on an open case.
        assert!(escalation_allowed(DunningStatus::Open, future, now, true).is_ok());
    }

    #[test]
    fn test_new_case_is_immediately_scannable() {
        let now = OffsetDateTime::now_utc();
        let deadline = initial_action_deadline(now);
        assert!(escalation_allowed(DunningStatus::Open, Some(deadline), now, false).is_ok());
    }

    #[test]
    fn test_cleared_deadline_leaves_automatic_path() {
        let now = OffsetDateTime::now_utc();
        // A NULL deadline (case converted to collection) is off limits to the
        // scheduler; an operator can still force the action.
        assert!(escalation_allowed(DunningStatus::Open, None, now, false).is_err());
        assert!(escalation_allowed(DunningStatus::Open, None, now, true).is_ok());
    }

    #[test]
    fn test_settlement_is_idempotent() {
        assert_eq!(settlement_allowed(DunningStatus::Open), Ok(true));
        assert_eq!(settlement_allowed(DunningStatus::Paid), Ok(false));
        assert!(settlement_allowed(DunningStatus::Cancelled).is_err());
    }

    #[test]
    fn test_deadline_boundary_is_inclusive() {
        let now = OffsetDateTime::now_utc();
        assert!(escalation_allowed(DunningStatus::Open, Some(now), now, false).is_ok());
    }

    #[test]
    fn test_balance_never_negative() {
        let case = DunningCase {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            escalation_level: 2,
            principal_cents: 10_000,
            late_fee_cents: 2_000,
            interest_cents: 0,
            total_cents: 12_000,
            amount_paid_cents: 15_000,
            status: DunningStatus::Paid,
            next_action_at: None,
            closed_at: Some(OffsetDateTime::now_utc()),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(case.balance_cents(), 0);
    }
}
