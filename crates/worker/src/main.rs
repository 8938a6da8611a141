//! Tessera Recovery Worker
//!
//! Handles scheduled jobs:
//! - Dunning deadline scan and automatic escalation (every 15 minutes)
//! - Notice outbox dispatch (every minute)
//! - Invariant sweep over the recovery tables (daily at 03:00 UTC)
//! - Heartbeat (every 5 minutes)
//!
//! Every job is safe to run concurrently with the API and with an
//! overlapping run of itself; all serialization happens at the database.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use tessera_collections::{
    Actor, CaseConverter, CollectionsError, DunningService, EscalationOutcome, FeeSchedule,
    InvariantChecker, NoticeDispatcher,
};
use tessera_shared::create_pool;

/// One scan pass: escalate every case whose deadline has elapsed, converting
/// cases that already sit at the final level.
async fn run_dunning_scan(dunning: &DunningService, converter: &CaseConverter) {
    let actor = Actor::scheduler();

    let due = match dunning.scan_due(200).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Dunning scan query failed");
            return;
        }
    };

    if due.is_empty() {
        return;
    }

    info!(due_cases = due.len(), "Dunning scan found due cases");

    let mut escalated = 0usize;
    let mut converted = 0usize;
    let mut skipped = 0usize;

    for case_id in due {
        match dunning.escalate(case_id, &actor, false).await {
            Ok(EscalationOutcome::Escalated(case)) => {
                escalated += 1;
                info!(
                    case_id = %case_id,
                    level = case.escalation_level,
                    total_cents = case.total_cents,
                    "Case escalated by scheduler"
                );
            }
            Ok(EscalationOutcome::FinalLevelReached(_)) => {
                match converter.convert(case_id, &actor).await {
                    Ok(collection_case) => {
                        converted += 1;
                        info!(
                            case_id = %case_id,
                            collection_case_id = %collection_case.id,
                            data_complete = collection_case.data_complete,
                            "Case converted to collection"
                        );
                    }
                    Err(e) => {
                        error!(case_id = %case_id, error = %e, "Conversion failed");
                    }
                }
            }
            // Another trigger (payment webhook, operator) got there first.
            Err(CollectionsError::InvalidStateTransition { .. })
            | Err(CollectionsError::ConcurrentModification { .. }) => {
                skipped += 1;
            }
            Err(e) => {
                error!(case_id = %case_id, error = %e, "Escalation failed");
            }
        }
    }

    info!(
        escalated = escalated,
        converted = converted,
        skipped = skipped,
        "Dunning scan complete"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Tessera Recovery Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;

    let dunning = Arc::new(DunningService::new(pool.clone(), FeeSchedule::from_env()));
    let converter = Arc::new(CaseConverter::new(pool.clone()));
    let dispatcher = Arc::new(NoticeDispatcher::from_env(pool.clone()));
    let invariants = Arc::new(InvariantChecker::new(pool.clone()));

    if !dispatcher.is_enabled() {
        warn!("Mail provider not configured (RESEND_API_KEY missing) - notices will fail until set");
    }

    let scheduler = JobScheduler::new().await?;

    // Job 1: Dunning deadline scan every 15 minutes
    let scan_dunning = dunning.clone();
    let scan_converter = converter.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let dunning = scan_dunning.clone();
            let converter = scan_converter.clone();
            Box::pin(async move {
                run_dunning_scan(&dunning, &converter).await;
            })
        })?)
        .await?;
    info!("Scheduled: Dunning deadline scan (every 15 minutes)");

    // Job 2: Notice outbox dispatch every minute
    let outbox_dispatcher = dispatcher.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let dispatcher = outbox_dispatcher.clone();
            Box::pin(async move {
                match dispatcher.process_pending(50).await {
                    Ok(summary) if summary.claimed > 0 => {
                        info!(
                            claimed = summary.claimed,
                            sent = summary.sent,
                            failed = summary.failed,
                            "Notice dispatch pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Notice dispatch pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Notice outbox dispatch (every minute)");

    // Job 3: Invariant sweep daily at 03:00 UTC
    let sweep_invariants = invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let invariants = sweep_invariants.clone();
            Box::pin(async move {
                match invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Invariant sweep healthy");
                    }
                    Ok(summary) => {
                        error!(
                            checks_failed = summary.checks_failed,
                            violation_count = summary.violations.len(),
                            "Invariant sweep found violations"
                        );
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                entity_ids = ?violation.entity_ids,
                                description = %violation.description,
                                "Invariant violation"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant sweep (daily at 03:00 UTC)");

    // Job 4: Heartbeat every 5 minutes
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    // Run one scan and one dispatch pass immediately so a restart doesn't
    // leave due cases waiting for the next tick.
    run_dunning_scan(&dunning, &converter).await;
    if let Err(e) = dispatcher.process_pending(50).await {
        error!(error = %e, "Initial notice dispatch pass failed");
    }

    // Keep the process alive
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
