//! Append-only audit log.
//!
//! Every state transition in the engine appends one immutable record. This
//! is the system of record for dispute resolution: no update or delete path
//! exists, and entries are queryable per entity in insertion order.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use tessera_shared::ActorType;

use crate::error::CollectionsResult;

/// Entity kinds that appear in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEntity {
    DunningCase,
    CollectionCase,
    CollectionExport,
    RetryRecord,
}

impl AuditEntity {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEntity::DunningCase => "dunning_case",
            AuditEntity::CollectionCase => "collection_case",
            AuditEntity::CollectionExport => "collection_export",
            AuditEntity::RetryRecord => "retry_record",
        }
    }
}

/// One immutable audit record as stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Builder for a single audit entry.
pub struct AuditEntry {
    entity: AuditEntity,
    entity_id: Uuid,
    action: String,
    actor_type: ActorType,
    actor_id: Option<String>,
    detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(entity: AuditEntity, entity_id: Uuid, action: impl Into<String>) -> Self {
        Self {
            entity,
            entity_id,
            action: action.into(),
            actor_type: ActorType::System,
            actor_id: None,
            detail: serde_json::json!({}),
        }
    }

    pub fn actor(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    /// Operator email or processor event id, depending on the actor.
    pub fn actor_id(mut self, id: impl Into<String>) -> Self {
        self.actor_id = Some(id.into());
        self
    }

    /// Before/after snapshot or delta for the transition.
    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Writer/reader for the audit log.
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

const INSERT_ENTRY: &str = r#"
    INSERT INTO audit_log (entity_type, entity_id, action, actor_type, actor_id, detail)
    VALUES ($1, $2, $3, $4, $5, $6)
"#;

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an entry outside any transaction.
    pub async fn log(&self, entry: AuditEntry) -> CollectionsResult<()> {
        sqlx::query(INSERT_ENTRY)
            .bind(entry.entity.as_str())
            .bind(entry.entity_id)
            .bind(&entry.action)
            .bind(entry.actor_type.as_str())
            .bind(&entry.actor_id)
            .bind(&entry.detail)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Append an entry inside the caller's transaction so the audit record
    /// commits atomically with the state change it describes.
    pub async fn log_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        entry: AuditEntry,
    ) -> CollectionsResult<()> {
        sqlx::query(INSERT_ENTRY)
            .bind(entry.entity.as_str())
            .bind(entry.entity_id)
            .bind(&entry.action)
            .bind(entry.actor_type.as_str())
            .bind(&entry.actor_id)
            .bind(&entry.detail)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// All entries for an entity, oldest first (insertion order).
    pub async fn for_entity(&self, entity_id: Uuid) -> CollectionsResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT id, entity_type, entity_id, action, actor_type, actor_id, detail, created_at
            FROM audit_log
            WHERE entity_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder_defaults() {
        let id = Uuid::new_v4();
        let entry = AuditEntry::new(AuditEntity::DunningCase, id, "escalated");
        assert_eq!(entry.entity.as_str(), "dunning_case");
        assert_eq!(entry.action, "escalated");
        assert_eq!(entry.actor_type, ActorType::System);
        assert!(entry.actor_id.is_none());
    }

    #[test]
    fn test_entry_builder_operator_attribution() {
        let entry = AuditEntry::new(AuditEntity::CollectionExport, Uuid::new_v4(), "created")
            .actor(ActorType::Operator)
            .actor_id("ops@tessera.live")
            .detail(serde_json::json!({ "agency": "AgencyX" }));
        assert_eq!(entry.actor_type, ActorType::Operator);
        assert_eq!(entry.actor_id.as_deref(), Some("ops@tessera.live"));
        assert_eq!(entry.detail["agency"], "AgencyX");
    }
}
