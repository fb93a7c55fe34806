//! Generic per-entity version lookup.
//!
//! `state_versions` mirrors the `version` column carried on each entity's own
//! table (`team_states`, `agent_states`), kept in lockstep in the same
//! transaction as every mutation. It lets entity-type-agnostic code -- audit
//! replay, rollback -- resolve an entity's current version without knowing
//! which concrete table backs it.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Upsert the tracked version for an entity within an existing transaction.
pub async fn set_version(
    tx: &mut Transaction<'_, Postgres>,
    entity_type: &str,
    entity_id: Uuid,
    version: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO state_versions (entity_type, entity_id, version) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (entity_type, entity_id) DO UPDATE SET version = EXCLUDED.version",
    )
    .bind(entity_type)
    .bind(entity_id)
    .bind(version)
    .execute(&mut **tx)
    .await
    .context("failed to set entity version")?;

    Ok(())
}

/// Get the tracked version for an entity, if any.
pub async fn get_version(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT version FROM state_versions WHERE entity_type = $1 AND entity_id = $2",
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_optional(pool)
    .await
    .context("failed to get entity version")?;

    Ok(row.map(|(v,)| v))
}
