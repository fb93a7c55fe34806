//! Database query functions for the `recovery_checkpoints` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Checkpoint;

/// Write a checkpoint. Never overwrites an existing one.
pub async fn insert(
    pool: &PgPool,
    id: Uuid,
    entity_type: &str,
    entity_id: Uuid,
    snapshot: serde_json::Value,
    reason: Option<&str>,
) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO recovery_checkpoints (id, entity_type, entity_id, snapshot, reason) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(id)
    .bind(entity_type)
    .bind(entity_id)
    .bind(snapshot)
    .bind(reason)
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// List checkpoints for an entity, most recent first.
pub async fn list_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM recovery_checkpoints \
         WHERE entity_type = $1 AND entity_id = $2 \
         ORDER BY ts DESC",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints")?;

    Ok(checkpoints)
}

/// Fetch the oldest retained checkpoint for an entity. `rollback` refuses to
/// go back further than this.
pub async fn oldest_for_entity(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM recovery_checkpoints \
         WHERE entity_type = $1 AND entity_id = $2 \
         ORDER BY ts ASC \
         LIMIT 1",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch oldest checkpoint")?;

    Ok(checkpoint)
}

/// Delete checkpoints older than `max_age` relative to now. Operator-driven
/// cleanup only; never runs automatically.
pub async fn cleanup(pool: &PgPool, max_age: chrono::Duration) -> Result<u64> {
    let cutoff = chrono::Utc::now() - max_age;
    let result = sqlx::query("DELETE FROM recovery_checkpoints WHERE ts < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to clean up checkpoints")?;

    Ok(result.rows_affected())
}
