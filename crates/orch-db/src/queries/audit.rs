//! Database query functions for the append-only `state_audit_log` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{AuditAction, AuditEntry};

/// Append one audit entry within an existing transaction, so the audit
/// record commits atomically with the state mutation it describes.
pub async fn insert_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    entity_type: &str,
    entity_id: Uuid,
    action: AuditAction,
    prev: Option<serde_json::Value>,
    next: Option<serde_json::Value>,
    triggered_by: &str,
    metadata: Option<serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO state_audit_log \
            (id, entity_type, entity_id, action, prev, next, triggered_by, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(prev)
    .bind(next)
    .bind(triggered_by)
    .bind(metadata)
    .execute(&mut **tx)
    .await
    .context("failed to insert audit entry")?;

    Ok(())
}

/// Append one audit entry outside of any caller-managed transaction.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    pool: &PgPool,
    id: Uuid,
    entity_type: &str,
    entity_id: Uuid,
    action: AuditAction,
    prev: Option<serde_json::Value>,
    next: Option<serde_json::Value>,
    triggered_by: &str,
    metadata: Option<serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO state_audit_log \
            (id, entity_type, entity_id, action, prev, next, triggered_by, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(action)
    .bind(prev)
    .bind(next)
    .bind(triggered_by)
    .bind(metadata)
    .execute(pool)
    .await
    .context("failed to insert audit entry")?;

    Ok(())
}

/// List audit entries for one entity, oldest first, optionally bounded by
/// a time range and a result limit.
pub async fn list_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM state_audit_log \
         WHERE entity_type = $1 AND entity_id = $2 AND ts >= COALESCE($3, to_timestamp(0)) \
         ORDER BY ts ASC \
         LIMIT $4",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(since)
    .bind(limit.unwrap_or(1000))
    .fetch_all(pool)
    .await
    .context("failed to list audit entries")?;

    Ok(entries)
}

/// Fetch the most recent audit entry for an entity (the entry describing
/// its current state).
pub async fn latest_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<Option<AuditEntry>> {
    let entry = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM state_audit_log \
         WHERE entity_type = $1 AND entity_id = $2 \
         ORDER BY ts DESC \
         LIMIT 1",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest audit entry")?;

    Ok(entry)
}
