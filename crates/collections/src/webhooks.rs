//! Payment processor webhook handling.
//!
//! Translates processor events into recovery actions: failed invoice
//! payments append to the retry ledger and open a dunning case, successful
//! payments settle the open case, subscription deletion cancels it.
//!
//! Deliveries are at-least-once and unordered, so every handler is
//! idempotent and every delivery first claims exclusive processing rights
//! in the event ledger before touching recovery state.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Charge, Event, EventObject, EventType, Invoice, Webhook};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tessera_shared::RetryOutcome;

use crate::dunning::{Actor, DunningService};
use crate::error::{CollectionsError, CollectionsResult};
use crate::ledger::{RetryAttempt, RetryLedger};

type HmacSha256 = Hmac<Sha256>;

/// Events stuck in 'processing' longer than this are re-claimable; the
/// worker that claimed them died before recording an outcome.
const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Claim rule for an event id that already has a ledger row.
///
/// 'success' is terminal and the redelivery is discarded. 'error' means the
/// prior attempt applied no side effects (handlers run inside the claim and
/// record the error afterwards), so the redelivery processes again.
/// 'processing' is re-claimable only once the claim stamp has aged past the
/// timeout.
pub fn reclaim_allowed(
    prior_result: &str,
    processing_started_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    match prior_result {
        "error" => true,
        "processing" => processing_started_at
            .map(|started| now - started > Duration::minutes(PROCESSING_TIMEOUT_MINUTES))
            .unwrap_or(true),
        _ => false,
    }
}

pub struct WebhookHandler {
    pool: PgPool,
    webhook_secret: String,
    ledger: RetryLedger,
    dunning: DunningService,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, webhook_secret: String, dunning: DunningService) -> Self {
        let ledger = RetryLedger::new(pool.clone());
        Self {
            pool,
            webhook_secret,
            ledger,
            dunning,
        }
    }

    /// Verify and parse a processor webhook delivery.
    ///
    /// Tries the library verifier first and falls back to manual signature
    /// verification, which tolerates payload fields newer than the library's
    /// pinned API version.
    pub fn verify_event(&self, payload: &str, signature: &str) -> CollectionsResult<Event> {
        match Webhook::construct_event(payload, signature, &self.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    verify_error = %e,
                    "Library webhook verification failed, trying manual verification"
                );
            }
        }

        // Signature header format: t=timestamp,v1=signature[,v0=signature]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(CollectionsError::WebhookSignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(CollectionsError::WebhookSignatureInvalid)?;

        // Reject replayed deliveries outside a 5 minute window.
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| CollectionsError::WebhookSignatureInvalid)?
            .as_secs() as i64;

        if (now - timestamp).abs() > 300 {
            tracing::warn!(
                timestamp = timestamp,
                skew_seconds = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(CollectionsError::WebhookSignatureInvalid);
        }

        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{timestamp}.{payload}");

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| CollectionsError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(CollectionsError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse verified webhook payload");
            CollectionsError::WebhookEventNotSupported(e.to_string())
        })?;

        Ok(event)
    }

    /// Handle a verified processor event.
    ///
    /// The claim in the event ledger grants exclusive processing rights: of
    /// two concurrent deliveries of the same event id, exactly one proceeds.
    /// A redelivery after a recorded error, or after the processing timeout,
    /// re-claims the event and runs the handlers again.
    pub async fn handle_event(&self, event: Event) -> CollectionsResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed = self
            .claim_event(&event_id, &event_type, event_timestamp)
            .await?;

        if !claimed {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook delivery, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        let recorded = sqlx::query(
            r#"
            UPDATE processor_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE processor_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = recorded {
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to record webhook processing outcome; event may appear stuck"
            );
        }

        result
    }

    /// Claim exclusive processing rights for an event id.
    ///
    /// A brand-new id inserts its ledger row directly. A known id locks the
    /// existing row and applies `reclaim_allowed` to the recorded outcome;
    /// the row lock serializes concurrent redeliveries so at most one
    /// re-claims.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> CollectionsResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO processor_webhook_events
                (processor_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (processor_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_some() {
            tx.commit().await?;
            return Ok(true);
        }

        let prior: Option<(String, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT processing_result, processing_started_at
            FROM processor_webhook_events
            WHERE processor_event_id = $1
            FOR UPDATE
            "#,
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let reclaim = match prior {
            Some((result, started_at)) => {
                reclaim_allowed(&result, started_at, OffsetDateTime::now_utc())
            }
            None => false,
        };

        if reclaim {
            sqlx::query(
                r#"
                UPDATE processor_webhook_events
                SET processing_result = 'processing',
                    processing_started_at = NOW(),
                    error_message = NULL
                WHERE processor_event_id = $1
                "#,
            )
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reclaim)
    }

    async fn process_event_internal(&self, event: &Event) -> CollectionsResult<()> {
        match event.type_ {
            EventType::InvoicePaymentFailed => {
                self.handle_payment_failed(event).await?;
            }
            EventType::InvoicePaid | EventType::InvoicePaymentSucceeded => {
                self.handle_payment_succeeded(event).await?;
            }
            EventType::ChargeFailed => {
                self.handle_charge_failed(event).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event).await?;
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "No handler configured for event type"
                );
            }
        }

        Ok(())
    }

    /// A processor retry failed: append to the ledger and make sure a
    /// dunning case is open for the subscription.
    async fn handle_payment_failed(&self, event: &Event) -> CollectionsResult<()> {
        let invoice = extract_invoice(event)?;
        let processor_subscription_id = invoice_subscription_reference(&invoice)?;
        let (subscription_id, user_id) = self
            .resolve_subscription(&processor_subscription_id)
            .await?;

        let amount_due = invoice.amount_due.unwrap_or(0);
        let attempt_count = invoice.attempt_count.unwrap_or(0);
        let failure_message = Some(format!(
            "invoice payment failed (processor attempt {attempt_count})"
        ));
        let next_retry_at = invoice
            .next_payment_attempt
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let outcome = if next_retry_at.is_some() {
            RetryOutcome::Pending
        } else {
            RetryOutcome::Failed
        };

        let record = self
            .ledger
            .record_attempt(RetryAttempt {
                subscription_id,
                payment_intent_id: invoice_payment_intent(&invoice),
                outcome,
                failure_code: None,
                failure_message,
                amount_cents: amount_due,
                currency: invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "eur".to_string()),
                next_retry_at,
            })
            .await?;

        let actor = Actor::processor(event.id.to_string());
        let (case, created) = self
            .dunning
            .ensure_open_case(subscription_id, user_id, amount_due, &actor)
            .await?;

        tracing::warn!(
            event_id = %event.id,
            subscription_id = %subscription_id,
            case_id = %case.id,
            attempt_number = record.attempt_number,
            amount_due_cents = amount_due,
            case_opened = created,
            "Invoice payment failed"
        );

        Ok(())
    }

    /// A payment went through: append the success to the ledger and settle
    /// the open dunning case, if one exists.
    async fn handle_payment_succeeded(&self, event: &Event) -> CollectionsResult<()> {
        let invoice = extract_invoice(event)?;
        let processor_subscription_id = invoice_subscription_reference(&invoice)?;
        let (subscription_id, _user_id) = self
            .resolve_subscription(&processor_subscription_id)
            .await?;

        let amount_paid = invoice.amount_paid.unwrap_or(0);

        self.ledger
            .record_attempt(RetryAttempt {
                subscription_id,
                payment_intent_id: invoice_payment_intent(&invoice),
                outcome: RetryOutcome::Succeeded,
                failure_code: None,
                failure_message: None,
                amount_cents: amount_paid,
                currency: invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "eur".to_string()),
                next_retry_at: None,
            })
            .await?;

        let open_case = self.dunning.find_open_by_subscription(subscription_id).await?;
        if let Some(case) = open_case {
            let actor = Actor::processor(event.id.to_string());
            self.dunning.mark_paid(case.id, &actor).await?;
            tracing::info!(
                event_id = %event.id,
                case_id = %case.id,
                amount_paid_cents = amount_paid,
                "Dunning case settled by successful payment"
            );
        }

        Ok(())
    }

    /// Charge-level failures carry richer decline detail than the invoice
    /// event; append them to the ledger when they can be attributed to a
    /// subscription.
    async fn handle_charge_failed(&self, event: &Event) -> CollectionsResult<()> {
        let charge = extract_charge(event)?;

        let Some(invoice) = charge_invoice_object(&charge) else {
            tracing::debug!(
                event_id = %event.id,
                "Charge failure not tied to an invoice, ignoring"
            );
            return Ok(());
        };

        let Ok(processor_subscription_id) = invoice_subscription_reference(&invoice) else {
            return Ok(());
        };
        let (subscription_id, _user_id) = self
            .resolve_subscription(&processor_subscription_id)
            .await?;

        self.ledger
            .record_attempt(RetryAttempt {
                subscription_id,
                payment_intent_id: charge_payment_intent(&charge),
                outcome: RetryOutcome::Failed,
                failure_code: charge.failure_code.clone(),
                failure_message: charge.failure_message.clone(),
                amount_cents: charge.amount,
                currency: charge.currency.to_string(),
                next_retry_at: None,
            })
            .await?;

        tracing::warn!(
            event_id = %event.id,
            subscription_id = %subscription_id,
            failure_code = ?charge.failure_code,
            "Charge failed"
        );

        Ok(())
    }

    /// The subscription no longer exists; there is nothing left to recover.
    async fn handle_subscription_deleted(&self, event: &Event) -> CollectionsResult<()> {
        let subscription = match &event.data.object {
            EventObject::Subscription(subscription) => subscription,
            _ => {
                return Err(CollectionsError::WebhookEventNotSupported(
                    "expected subscription object".to_string(),
                ))
            }
        };

        let resolved = self.resolve_subscription(subscription.id.as_str()).await;
        let (subscription_id, _user_id) = match resolved {
            Ok(pair) => pair,
            Err(CollectionsError::SubscriptionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Some(case) = self.dunning.find_open_by_subscription(subscription_id).await? {
            let actor = Actor::processor(event.id.to_string());
            self.dunning.cancel(case.id, &actor).await?;
            tracing::info!(
                event_id = %event.id,
                case_id = %case.id,
                "Dunning case cancelled after subscription deletion"
            );
        }

        Ok(())
    }

    async fn resolve_subscription(
        &self,
        processor_subscription_id: &str,
    ) -> CollectionsResult<(Uuid, Uuid)> {
        let row: Option<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, user_id
            FROM subscriptions
            WHERE processor_subscription_id = $1
            "#,
        )
        .bind(processor_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| {
            CollectionsError::SubscriptionNotFound(processor_subscription_id.to_string())
        })
    }
}

fn extract_invoice(event: &Event) -> CollectionsResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(CollectionsError::WebhookEventNotSupported(
            "expected invoice object".to_string(),
        )),
    }
}

fn extract_charge(event: &Event) -> CollectionsResult<Charge> {
    match &event.data.object {
        EventObject::Charge(charge) => Ok(charge.clone()),
        _ => Err(CollectionsError::WebhookEventNotSupported(
            "expected charge object".to_string(),
        )),
    }
}

fn invoice_subscription_reference(invoice: &Invoice) -> CollectionsResult<String> {
    match &invoice.subscription {
        Some(stripe::Expandable::Id(id)) => Ok(id.to_string()),
        Some(stripe::Expandable::Object(s)) => Ok(s.id.to_string()),
        None => Err(CollectionsError::WebhookEventNotSupported(
            "invoice has no subscription".to_string(),
        )),
    }
}

fn invoice_payment_intent(invoice: &Invoice) -> Option<String> {
    match &invoice.payment_intent {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(pi)) => Some(pi.id.to_string()),
        None => None,
    }
}

fn charge_invoice_object(charge: &Charge) -> Option<Invoice> {
    match &charge.invoice {
        Some(stripe::Expandable::Object(invoice)) => Some((**invoice).clone()),
        // An unexpanded id carries no subscription reference to act on.
        _ => None,
    }
}

fn charge_payment_intent(charge: &Charge) -> Option<String> {
    match &charge.payment_intent {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(pi)) => Some(pi.id.to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_event_is_never_reprocessed() {
        let now = OffsetDateTime::now_utc();
        assert!(!reclaim_allowed("success", Some(now - Duration::hours(2)), now));
        assert!(!reclaim_allowed("success", None, now));
    }

    // An error outcome means no side effects were confirmed; the processor's
    // redelivery must run the handlers again rather than being discarded.
    #[test]
    fn test_errored_event_is_reclaimed_on_redelivery() {
        let now = OffsetDateTime::now_utc();
        assert!(reclaim_allowed("error", Some(now - Duration::seconds(10)), now));
        assert!(reclaim_allowed("error", None, now));
    }

    #[test]
    fn test_in_flight_event_is_reclaimed_only_after_timeout() {
        let now = OffsetDateTime::now_utc();
        assert!(!reclaim_allowed(
            "processing",
            Some(now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES - 1)),
            now
        ));
        assert!(reclaim_allowed(
            "processing",
            Some(now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES + 1)),
            now
        ));
        // No claim stamp at all means the claiming worker never got started.
        assert!(reclaim_allowed("processing", None, now));
    }
}
