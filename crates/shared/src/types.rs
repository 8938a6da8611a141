//! Domain enums shared across the recovery engine, API and worker.
//!
//! Each enum maps to a TEXT column; the string forms are part of the
//! persisted schema and must stay stable.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a dunning case.
///
/// `Paid` and `Cancelled` are terminal; a closed case is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DunningStatus {
    Open,
    Paid,
    Cancelled,
}

impl DunningStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DunningStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DunningStatus::Open => "open",
            DunningStatus::Paid => "paid",
            DunningStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for DunningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a collection case handed toward an external agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Open,
    Forwarded,
    Paid,
    Closed,
    WrittenOff,
}

impl CollectionStatus {
    /// Forwarding is the only transition out of `Open`; everything after
    /// `Forwarded` is settled between operators and the agency.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CollectionStatus::Paid | CollectionStatus::Closed | CollectionStatus::WrittenOff
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectionStatus::Open => "open",
            CollectionStatus::Forwarded => "forwarded",
            CollectionStatus::Paid => "paid",
            CollectionStatus::Closed => "closed",
            CollectionStatus::WrittenOff => "written_off",
        }
    }
}

impl std::fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handling priority assigned when a collection case is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl CasePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            CasePriority::Low => "low",
            CasePriority::Normal => "normal",
            CasePriority::High => "high",
            CasePriority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for CasePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single payment-processor retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    Pending,
    Failed,
    RequiresAction,
    Succeeded,
}

impl RetryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryOutcome::Pending => "pending",
            RetryOutcome::Failed => "failed",
            RetryOutcome::RequiresAction => "requires_action",
            RetryOutcome::Succeeded => "succeeded",
        }
    }
}

impl std::fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused an audited state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Webhook delivery from the payment processor.
    Processor,
    /// Time-driven scheduler job.
    Scheduler,
    /// Authenticated operator acting from the admin console.
    Operator,
    /// Internal engine action not attributable to the above.
    System,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::Processor => "processor",
            ActorType::Scheduler => "scheduler",
            ActorType::Operator => "operator",
            ActorType::System => "system",
        }
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_dunning_states() {
        assert!(!DunningStatus::Open.is_terminal());
        assert!(DunningStatus::Paid.is_terminal());
        assert!(DunningStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_collection_status_strings() {
        assert_eq!(CollectionStatus::WrittenOff.as_str(), "written_off");
        assert_eq!(CollectionStatus::Forwarded.to_string(), "forwarded");
        assert!(!CollectionStatus::Forwarded.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(CasePriority::Urgent > CasePriority::High);
        assert!(CasePriority::High > CasePriority::Normal);
        assert!(CasePriority::Normal > CasePriority::Low);
    }
}
