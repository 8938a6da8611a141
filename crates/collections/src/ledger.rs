//! Payment retry ledger.
//!
//! Append-only record of every processor retry attempt for a subscription.
//! A new attempt always appends a new row; prior rows are never mutated.
//! Attempt numbers are monotonic per subscription and assigned inside the
//! insert transaction so concurrent webhook deliveries cannot collide.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tessera_shared::RetryOutcome;

use crate::error::{CollectionsError, CollectionsResult};

/// One processor retry attempt as stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentRetryRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub payment_intent_id: Option<String>,
    pub attempt_number: i32,
    pub outcome: RetryOutcome,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub next_retry_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Input for a new ledger entry.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub subscription_id: Uuid,
    pub payment_intent_id: Option<String>,
    pub outcome: RetryOutcome,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub next_retry_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct RetryLedger {
    pool: PgPool,
}

impl RetryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an attempt, assigning the next attempt number.
    ///
    /// The `MAX(attempt_number) + 1` read and the insert run in one
    /// transaction; the unique constraint on (subscription_id,
    /// attempt_number) turns a lost race into a retryable conflict instead
    /// of a duplicate number.
    pub async fn record_attempt(
        &self,
        attempt: RetryAttempt,
    ) -> CollectionsResult<PaymentRetryRecord> {
        let mut tx = self.pool.begin().await?;

        let next_number: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(attempt_number), 0) + 1
            FROM payment_retry_records
            WHERE subscription_id = $1
            "#,
        )
        .bind(attempt.subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        let record = sqlx::query_as::<_, PaymentRetryRecord>(
            r#"
            INSERT INTO payment_retry_records (
                subscription_id, payment_intent_id, attempt_number, outcome,
                failure_code, failure_message, amount_cents, currency, next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, subscription_id, payment_intent_id, attempt_number, outcome,
                      failure_code, failure_message, amount_cents, currency,
                      next_retry_at, created_at
            "#,
        )
        .bind(attempt.subscription_id)
        .bind(&attempt.payment_intent_id)
        .bind(next_number)
        .bind(attempt.outcome)
        .bind(&attempt.failure_code)
        .bind(&attempt.failure_message)
        .bind(attempt.amount_cents)
        .bind(&attempt.currency)
        .bind(attempt.next_retry_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CollectionsError::ConcurrentModification {
                    entity: "payment_retry_records",
                    id: attempt.subscription_id,
                }
            }
            _ => CollectionsError::Database(e),
        })?;

        tx.commit().await?;

        tracing::debug!(
            subscription_id = %record.subscription_id,
            attempt_number = record.attempt_number,
            outcome = %record.outcome,
            "Retry attempt recorded"
        );

        Ok(record)
    }

    /// Full retry history for a subscription, oldest attempt first.
    pub async fn for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> CollectionsResult<Vec<PaymentRetryRecord>> {
        let records = sqlx::query_as::<_, PaymentRetryRecord>(
            r#"
            SELECT id, subscription_id, payment_intent_id, attempt_number, outcome,
                   failure_code, failure_message, amount_cents, currency,
                   next_retry_at, created_at
            FROM payment_retry_records
            WHERE subscription_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Latest attempt for a subscription, if any.
    pub async fn latest_attempt(
        &self,
        subscription_id: Uuid,
    ) -> CollectionsResult<Option<PaymentRetryRecord>> {
        let record = sqlx::query_as::<_, PaymentRetryRecord>(
            r#"
            SELECT id, subscription_id, payment_intent_id, attempt_number, outcome,
                   failure_code, failure_message, amount_cents, currency,
                   next_retry_at, created_at
            FROM payment_retry_records
            WHERE subscription_id = $1
            ORDER BY attempt_number DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
