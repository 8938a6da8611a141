#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tessera Payment Recovery & Collections Engine
//!
//! Drives overdue subscription payments from the first failed retry through
//! dunning escalation to external debt collection.
//!
//! ## Features
//!
//! - **Retry Ledger**: Append-only record of every processor retry attempt
//! - **Dunning Cases**: Level 0-3 state machine with per-level late fees
//! - **Notice Outbox**: Transactional enqueue, out-of-band dispatch
//! - **Collection Conversion**: Checklist-validated handoff after level 3
//! - **Export Batches**: Atomic all-or-nothing forwarding to agencies
//! - **Audit Log**: Append-only trail for dispute resolution
//! - **Webhooks**: Idempotent processor event handling

pub mod audit;
pub mod convert;
pub mod dunning;
pub mod error;
pub mod export;
pub mod fees;
pub mod interest;
pub mod invariants;
pub mod ledger;
pub mod notices;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{AuditEntity, AuditEntry, AuditLogger, AuditRecord};

// Conversion
pub use convert::{
    completeness_percentage, priority_for_amount, CaseConverter, CollectionCase, DebtorChecklist,
    REQUIRED_FIELDS,
};

// Dunning
pub use dunning::{
    escalation_allowed, initial_action_deadline, settlement_allowed, Actor, DunningCase,
    DunningService, EscalationOutcome, MAX_ESCALATION_LEVEL,
};

// Error
pub use error::{CollectionsError, CollectionsResult};

// Exports
pub use export::{
    normalize_case_ids, validate_batch, CollectionExport, ExportBatcher, ExportRequest,
};

// Fees
pub use fees::{FeeSchedule, FeeStep};

// Interest
pub use interest::{InterestStrategy, NoInterest};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity, CHECK_NAMES,
};

// Ledger
pub use ledger::{PaymentRetryRecord, RetryAttempt, RetryLedger};

// Notices
pub use notices::{
    sending_reclaim_cutoff, DispatchOutcome, DispatchSummary, NoticeDispatcher, NoticeRecord,
};

// Webhooks
pub use webhooks::{reclaim_allowed, WebhookHandler};

use sqlx::PgPool;

/// Main recovery service combining every engine component.
pub struct CollectionsService {
    pub ledger: RetryLedger,
    pub dunning: DunningService,
    pub notices: NoticeDispatcher,
    pub converter: CaseConverter,
    pub exports: ExportBatcher,
    pub audit: AuditLogger,
    pub invariants: InvariantChecker,
    pub webhooks: WebhookHandler,
}

impl CollectionsService {
    /// Build the service from environment variables.
    pub fn from_env(pool: PgPool) -> CollectionsResult<Self> {
        let webhook_secret = std::env::var("PROCESSOR_WEBHOOK_SECRET").map_err(|_| {
            CollectionsError::Internal("PROCESSOR_WEBHOOK_SECRET must be set".to_string())
        })?;

        Ok(Self::new(pool, FeeSchedule::from_env(), webhook_secret))
    }

    /// Build the service with an explicit fee schedule and webhook secret.
    pub fn new(pool: PgPool, fees: FeeSchedule, webhook_secret: String) -> Self {
        let dunning = DunningService::new(pool.clone(), fees);

        Self {
            ledger: RetryLedger::new(pool.clone()),
            notices: NoticeDispatcher::from_env(pool.clone()),
            converter: CaseConverter::new(pool.clone()),
            exports: ExportBatcher::new(pool.clone()),
            audit: AuditLogger::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            webhooks: WebhookHandler::new(pool, webhook_secret, dunning.clone()),
            dunning,
        }
    }
}
