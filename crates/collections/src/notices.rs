//! Notice dispatcher.
//!
//! Consumes the notice outbox written by the dunning state machine. The
//! escalation that enqueued a notice is already durable by the time a row
//! becomes visible here, so a slow or failing mail provider can never hold a
//! case lock or roll back a level transition: every dispatch attempt is
//! recorded on the notice row, success or failure, and failures are surfaced
//! for manual re-send.

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{CollectionsError, CollectionsResult};

/// A notice row as stored (the ordered sub-list attached to a case).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NoticeRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub level: i16,
    pub recipient: String,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub enqueued_at: OffsetDateTime,
    pub sent_at: Option<OffsetDateTime>,
}

/// Terminal outcome of one dispatch attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub delivered: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

/// Claimed notice joined with the case amounts needed to render it.
#[derive(Debug, sqlx::FromRow)]
struct ClaimedNotice {
    id: Uuid,
    case_id: Uuid,
    level: i16,
    recipient: String,
    total_cents: i64,
    next_action_at: Option<OffsetDateTime>,
}

/// Summary of one outbox processing pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Sends dunning notices through the hosted mail provider.
#[derive(Clone)]
pub struct NoticeDispatcher {
    pool: PgPool,
    client: reqwest::Client,
    api_key: String,
    from_address: String,
}

/// Rows stuck in 'sending' longer than this are re-claimed; the worker that
/// claimed them died mid-dispatch.
const SENDING_TIMEOUT_MINUTES: i64 = 10;

/// Cutoff for re-claiming 'sending' rows, keyed on the claim stamp rather
/// than the enqueue time: a notice that sat pending for an hour and was then
/// claimed is in flight, not stuck.
pub fn sending_reclaim_cutoff(now: OffsetDateTime) -> OffsetDateTime {
    now - Duration::minutes(SENDING_TIMEOUT_MINUTES)
}

impl NoticeDispatcher {
    pub fn from_env(pool: PgPool) -> Self {
        let api_key = std::env::var("RESEND_API_KEY").unwrap_or_default();
        let from_address = std::env::var("NOTICE_FROM_ADDRESS")
            .unwrap_or_else(|_| "billing@tessera.live".to_string());

        Self {
            pool,
            client: reqwest::Client::new(),
            api_key,
            from_address,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Claim and dispatch up to `batch_size` pending notices.
    ///
    /// The claim is an atomic status flip with SKIP LOCKED, so overlapping
    /// worker runs never dispatch the same notice twice. Network I/O happens
    /// after the claim commits; no database lock is held across the send.
    pub async fn process_pending(&self, batch_size: i64) -> CollectionsResult<DispatchSummary> {
        let claimed: Vec<ClaimedNotice> = sqlx::query_as(
            r#"
            UPDATE dunning_notices n
            SET status = 'sending', attempts = n.attempts + 1, claimed_at = NOW()
            FROM dunning_cases c
            WHERE n.id IN (
                SELECT id FROM dunning_notices
                WHERE status = 'pending'
                   OR (status = 'sending' AND claimed_at < $2)
                ORDER BY enqueued_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
              AND c.id = n.case_id
            RETURNING n.id, n.case_id, n.level, n.recipient, c.total_cents, c.next_action_at
            "#,
        )
        .bind(batch_size)
        .bind(sending_reclaim_cutoff(OffsetDateTime::now_utc()))
        .fetch_all(&self.pool)
        .await?;

        let mut summary = DispatchSummary {
            claimed: claimed.len(),
            ..Default::default()
        };

        for notice in claimed {
            let outcome = self
                .send(notice.level, &notice.recipient, notice.total_cents, notice.next_action_at)
                .await;

            let recorded = self.record_outcome(notice.id, &outcome).await;
            if let Err(e) = recorded {
                tracing::error!(
                    notice_id = %notice.id,
                    case_id = %notice.case_id,
                    error = %e,
                    "Failed to record notice dispatch outcome"
                );
                continue;
            }

            if outcome.delivered {
                summary.sent += 1;
                tracing::info!(
                    notice_id = %notice.id,
                    case_id = %notice.case_id,
                    level = notice.level,
                    "Dunning notice sent"
                );
            } else {
                summary.failed += 1;
                tracing::warn!(
                    notice_id = %notice.id,
                    case_id = %notice.case_id,
                    level = notice.level,
                    error = ?outcome.error,
                    "Dunning notice dispatch failed - flagged for manual re-send"
                );
            }
        }

        Ok(summary)
    }

    /// Re-enqueue a failed notice for another dispatch pass.
    pub async fn requeue(&self, notice_id: Uuid) -> CollectionsResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE dunning_notices
            SET status = 'pending', error_message = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(notice_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(CollectionsError::InvalidStateTransition {
                state: "not failed".into(),
                action: "requeue_notice".into(),
            });
        }

        Ok(())
    }

    /// One send attempt against the provider, with bounded backoff.
    ///
    /// Any response, including failure, is terminal for this attempt;
    /// longer-horizon retries are the provider's concern, not this engine's.
    async fn send(
        &self,
        level: i16,
        recipient: &str,
        total_cents: i64,
        deadline: Option<OffsetDateTime>,
    ) -> DispatchOutcome {
        if !self.is_enabled() {
            return DispatchOutcome {
                delivered: false,
                provider_message_id: None,
                error: Some("mail provider not configured (RESEND_API_KEY missing)".into()),
            };
        }

        let subject = match level {
            1 => "Payment reminder: your subscription payment is overdue",
            2 => "Second reminder: overdue payment and late fee applied",
            _ => "Final notice before debt collection",
        };

        let deadline_text = deadline
            .map(|d| d.date().to_string())
            .unwrap_or_else(|| "immediately".to_string());

        let body = format!(
            "Your outstanding balance is {:.2} EUR. Please settle it by {}.",
            total_cents as f64 / 100.0,
            deadline_text,
        );

        let payload = serde_json::json!({
            "from": self.from_address,
            "to": [recipient],
            "subject": subject,
            "text": body,
        });

        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);

        let result = Retry::spawn(strategy, || async {
            let response = self
                .client
                .post("https://api.resend.com/emails")
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            if response.status().is_server_error() {
                return Err(format!("provider returned {}", response.status()));
            }

            Ok(response)
        })
        .await;

        match result {
            Ok(response) if response.status().is_success() => {
                let message_id = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v["id"].as_str().map(String::from));

                DispatchOutcome {
                    delivered: true,
                    provider_message_id: message_id,
                    error: None,
                }
            }
            Ok(response) => DispatchOutcome {
                delivered: false,
                provider_message_id: None,
                error: Some(format!("provider rejected notice: {}", response.status())),
            },
            Err(e) => DispatchOutcome {
                delivered: false,
                provider_message_id: None,
                error: Some(e),
            },
        }
    }

    async fn record_outcome(
        &self,
        notice_id: Uuid,
        outcome: &DispatchOutcome,
    ) -> CollectionsResult<()> {
        sqlx::query(
            r#"
            UPDATE dunning_notices
            SET status = CASE WHEN $2 THEN 'sent' ELSE 'failed' END,
                provider_message_id = $3,
                error_message = $4,
                sent_at = CASE WHEN $2 THEN NOW() ELSE sent_at END
            WHERE id = $1
            "#,
        )
        .bind(notice_id)
        .bind(outcome.delivered)
        .bind(&outcome.provider_message_id)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Notices for a case in enqueue order.
pub(crate) async fn notices_for_case(
    pool: &PgPool,
    case_id: Uuid,
) -> CollectionsResult<Vec<NoticeRecord>> {
    let records = sqlx::query_as::<_, NoticeRecord>(
        r#"
        SELECT id, case_id, level, recipient, status, provider_message_id,
               error_message, attempts, enqueued_at, sent_at
        FROM dunning_notices
        WHERE case_id = $1
        ORDER BY enqueued_at ASC, id ASC
        "#,
    )
    .bind(case_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two workers racing on a notice that waited long in the queue must not
    // both claim it; only the claim stamp ages a row into re-claimability.
    #[test]
    fn test_reclaim_keyed_on_claim_time_not_enqueue_time() {
        let now = OffsetDateTime::now_utc();
        let cutoff = sending_reclaim_cutoff(now);

        let just_claimed = now - Duration::seconds(5);
        assert!(just_claimed >= cutoff, "a fresh claim is in flight");

        let enqueued_long_ago = now - Duration::minutes(45);
        assert!(enqueued_long_ago < cutoff, "age alone would wrongly re-claim");
    }

    #[test]
    fn test_reclaim_cutoff_boundary() {
        let now = OffsetDateTime::now_utc();
        let cutoff = sending_reclaim_cutoff(now);

        assert!(now - Duration::minutes(SENDING_TIMEOUT_MINUTES + 1) < cutoff);
        assert!(now - Duration::minutes(SENDING_TIMEOUT_MINUTES - 1) >= cutoff);
    }
}
