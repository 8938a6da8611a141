//! Error taxonomy for the recovery engine.
//!
//! Admin-facing operations report a stable `code()` so callers can
//! distinguish rejected transitions from retryable conflicts and from
//! idempotent no-ops.

use uuid::Uuid;

pub type CollectionsResult<T> = Result<T, CollectionsError>;

#[derive(Debug, thiserror::Error)]
pub enum CollectionsError {
    /// The requested transition is not legal from the entity's current state.
    #[error("invalid state transition: {action} not allowed from {state}")]
    InvalidStateTransition { state: String, action: String },

    /// Another trigger mutated the entity between read and write. Retryable.
    #[error("concurrent modification of {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: Uuid },

    /// The operation was already applied; replaying it is a no-op.
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    /// A collection case is missing legally required fields.
    #[error("incomplete data: missing {}", missing.join(", "))]
    IncompleteData { missing: Vec<String> },

    /// A transient failure in an external collaborator (mail provider,
    /// agency delivery). The authoritative state transition is not affected.
    #[error("external dependency failure: {0}")]
    ExternalDependency(String),

    #[error("dunning case {0} not found")]
    CaseNotFound(Uuid),

    #[error("collection case {0} not found")]
    CollectionCaseNotFound(Uuid),

    #[error("export {0} not found")]
    ExportNotFound(Uuid),

    #[error("no subscription for processor reference {0}")]
    SubscriptionNotFound(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("unsupported webhook payload: {0}")]
    WebhookEventNotSupported(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CollectionsError {
    /// Stable machine-readable code surfaced to admin callers.
    pub fn code(&self) -> &'static str {
        match self {
            CollectionsError::InvalidStateTransition { .. } => "invalid_state_transition",
            CollectionsError::ConcurrentModification { .. } => "concurrent_modification",
            CollectionsError::AlreadyProcessed(_) => "already_processed",
            CollectionsError::IncompleteData { .. } => "incomplete_data",
            CollectionsError::ExternalDependency(_) => "external_dependency_failure",
            CollectionsError::CaseNotFound(_)
            | CollectionsError::CollectionCaseNotFound(_)
            | CollectionsError::ExportNotFound(_)
            | CollectionsError::SubscriptionNotFound(_) => "not_found",
            CollectionsError::WebhookSignatureInvalid => "webhook_signature_invalid",
            CollectionsError::WebhookEventNotSupported(_) => "webhook_event_not_supported",
            CollectionsError::Database(_) => "database_error",
            CollectionsError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may safely retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectionsError::ConcurrentModification { .. }
                | CollectionsError::ExternalDependency(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = CollectionsError::InvalidStateTransition {
            state: "paid".into(),
            action: "escalate".into(),
        };
        assert_eq!(err.code(), "invalid_state_transition");

        let err = CollectionsError::IncompleteData {
            missing: vec!["legal_name".into(), "address".into()],
        };
        assert_eq!(err.code(), "incomplete_data");
        assert!(err.to_string().contains("legal_name, address"));

        assert_eq!(
            CollectionsError::AlreadyProcessed("evt_123".into()).code(),
            "already_processed"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CollectionsError::ConcurrentModification {
            entity: "dunning_case",
            id: Uuid::new_v4(),
        }
        .is_retryable());
        assert!(CollectionsError::ExternalDependency("timeout".into()).is_retryable());
        assert!(!CollectionsError::WebhookSignatureInvalid.is_retryable());
        assert!(!CollectionsError::AlreadyProcessed("x".into()).is_retryable());
    }
}
