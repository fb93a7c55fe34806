//! Forward-written rollback: `rollback(entity, target_version)` restores an
//! entity to a prior recorded state without deleting history. A checkpoint
//! of the current state is taken first, then the target snapshot is written
//! back as a new version (bumping forward, never rewinding `version`).

use sqlx::PgPool;
use uuid::Uuid;

use orch_db::models::{Agent, AuditAction, AuditEntry, Team};
use orch_db::queries::{agents, audit, checkpoints, teams, versions};

use crate::clock::new_id;
use crate::error::OrchError;

/// Roll `entity_type` (`"agent"` or `"team"`) back to `target_version`.
///
/// Returns `Ok(false)` if `target_version` cannot be located in the audit
/// trail, or predates the oldest checkpoint retained for the entity.
pub async fn rollback(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    target_version: i64,
    triggered_by: &str,
) -> Result<bool, OrchError> {
    match entity_type {
        "agent" => rollback_agent(pool, entity_id, target_version, triggered_by).await,
        "team" => rollback_team(pool, entity_id, target_version, triggered_by).await,
        other => Err(OrchError::Internal(format!("rollback: unknown entity type {other}"))),
    }
}

/// Find the audit entry whose `next` snapshot is the one that produced
/// `target_version`, if any.
fn find_target_snapshot(entries: &[AuditEntry], target_version: i64) -> Option<serde_json::Value> {
    entries.iter().rev().find_map(|entry| {
        let next = entry.next.as_ref()?;
        let version = next.get("version")?.as_i64()?;
        (version == target_version).then(|| next.clone())
    })
}

async fn below_checkpoint_floor(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    target_version: i64,
) -> Result<bool, OrchError> {
    let floor = checkpoints::oldest_for_entity(pool, entity_type, entity_id)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;
    Ok(floor
        .and_then(|cp| cp.snapshot.get("version").and_then(|v| v.as_i64()))
        .is_some_and(|floor_version| target_version < floor_version))
}

async fn rollback_agent(
    pool: &PgPool,
    agent_id: Uuid,
    target_version: i64,
    triggered_by: &str,
) -> Result<bool, OrchError> {
    let current = agents::get_agent(pool, agent_id)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?
        .ok_or(OrchError::NotFound { entity_type: "agent", id: agent_id })?;

    if below_checkpoint_floor(pool, "agent", agent_id, target_version).await? {
        return Ok(false);
    }

    let entries = audit::list_for_entity(pool, "agent", agent_id, None, None)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;
    let Some(snapshot_json) = find_target_snapshot(&entries, target_version) else {
        return Ok(false);
    };
    let snapshot: Agent =
        serde_json::from_value(snapshot_json).map_err(|e| OrchError::Internal(e.to_string()))?;

    checkpoints::insert(
        pool,
        new_id(),
        "agent",
        agent_id,
        serde_json::to_value(&current).map_err(|e| OrchError::Internal(e.to_string()))?,
        Some("pre-rollback"),
    )
    .await
    .map_err(|e| OrchError::Internal(e.to_string()))?;

    let mut tx = pool.begin().await.map_err(|e| OrchError::Internal(e.to_string()))?;

    let rows = agents::restore_snapshot_tx(&mut tx, &snapshot, current.version)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;
    if rows == 0 {
        tx.rollback().await.map_err(|e| OrchError::Internal(e.to_string()))?;
        return Err(OrchError::OptimisticLock {
            entity_type: "agent",
            id: agent_id,
            expected: current.version,
            actual: current.version,
        });
    }

    let mut restored = snapshot;
    restored.version = current.version + 1;

    audit::insert_tx(
        &mut tx,
        new_id(),
        "agent",
        agent_id,
        AuditAction::Update,
        serde_json::to_value(&current).ok(),
        serde_json::to_value(&restored).ok(),
        triggered_by,
        Some(serde_json::json!({"rollback_to_version": target_version})),
    )
    .await
    .map_err(|e| OrchError::Internal(e.to_string()))?;

    versions::set_version(&mut tx, "agent", agent_id, restored.version)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| OrchError::Internal(e.to_string()))?;

    tracing::info!(agent_id = %agent_id, target_version, "agent rolled back");
    Ok(true)
}

async fn rollback_team(
    pool: &PgPool,
    team_id: Uuid,
    target_version: i64,
    triggered_by: &str,
) -> Result<bool, OrchError> {
    let current = teams::get_team(pool, team_id)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?
        .ok_or(OrchError::NotFound { entity_type: "team", id: team_id })?;

    if below_checkpoint_floor(pool, "team", team_id, target_version).await? {
        return Ok(false);
    }

    let entries = audit::list_for_entity(pool, "team", team_id, None, None)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;
    let Some(snapshot_json) = find_target_snapshot(&entries, target_version) else {
        return Ok(false);
    };
    let snapshot: Team =
        serde_json::from_value(snapshot_json).map_err(|e| OrchError::Internal(e.to_string()))?;

    checkpoints::insert(
        pool,
        new_id(),
        "team",
        team_id,
        serde_json::to_value(&current).map_err(|e| OrchError::Internal(e.to_string()))?,
        Some("pre-rollback"),
    )
    .await
    .map_err(|e| OrchError::Internal(e.to_string()))?;

    let mut tx = pool.begin().await.map_err(|e| OrchError::Internal(e.to_string()))?;

    let rows = teams::restore_snapshot_tx(&mut tx, &snapshot, current.version)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;
    if rows == 0 {
        tx.rollback().await.map_err(|e| OrchError::Internal(e.to_string()))?;
        return Err(OrchError::OptimisticLock {
            entity_type: "team",
            id: team_id,
            expected: current.version,
            actual: current.version,
        });
    }

    let mut restored = snapshot;
    restored.version = current.version + 1;

    audit::insert_tx(
        &mut tx,
        new_id(),
        "team",
        team_id,
        AuditAction::Update,
        serde_json::to_value(&current).ok(),
        serde_json::to_value(&restored).ok(),
        triggered_by,
        Some(serde_json::json!({"rollback_to_version": target_version})),
    )
    .await
    .map_err(|e| OrchError::Internal(e.to_string()))?;

    versions::set_version(&mut tx, "team", team_id, restored.version)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

    tx.commit().await.map_err(|e| OrchError::Internal(e.to_string()))?;

    tracing::info!(team_id = %team_id, target_version, "team rolled back");
    Ok(true)
}
