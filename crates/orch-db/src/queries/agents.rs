//! Database query functions for the `agent_states` and
//! `agent_state_history` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Agent, AgentStatus, LifecycleState};

/// Insert a new agent row with `version = 0`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_agent(
    pool: &PgPool,
    id: Uuid,
    team_id: Option<Uuid>,
    parent_id: Option<Uuid>,
    model: &str,
    task: &str,
    metadata: serde_json::Value,
    max_retries: i32,
) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agent_states \
            (id, team_id, parent_id, status, lifecycle_state, model, task, metadata, max_retries) \
         VALUES ($1, $2, $3, 'pending', 'initializing', $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(id)
    .bind(team_id)
    .bind(parent_id)
    .bind(model)
    .bind(task)
    .bind(metadata)
    .bind(max_retries)
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agent_states WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Fetch an agent by its bound gateway session key.
pub async fn get_agent_by_session(pool: &PgPool, session_id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agent_states WHERE session_id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent by session")?;

    Ok(agent)
}

/// List all agents belonging to a team.
pub async fn list_agents_for_team(pool: &PgPool, team_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agent_states WHERE team_id = $1 ORDER BY created_at ASC",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await
    .context("failed to list agents for team")?;

    Ok(agents)
}

/// Bind a gateway session key to an agent (on successful spawn).
pub async fn bind_session(pool: &PgPool, agent_id: Uuid, session_id: &str) -> Result<()> {
    sqlx::query("UPDATE agent_states SET session_id = $1 WHERE id = $2")
        .bind(session_id)
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to bind agent session")?;

    Ok(())
}

/// Clear an agent's bound gateway session (on session teardown).
pub async fn clear_session(pool: &PgPool, agent_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE agent_states SET session_id = NULL WHERE id = $1")
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to clear agent session")?;

    Ok(())
}

/// Atomically transition an agent's lifecycle state, guarded by its current
/// version. Also updates the user-visible `status` and any timestamps
/// implied by the transition.
///
/// Returns the number of rows affected (0 means a conflicting write already
/// landed, or the row does not exist).
#[allow(clippy::too_many_arguments)]
pub async fn transition_lifecycle_state(
    pool: &PgPool,
    agent_id: Uuid,
    expected_version: i64,
    to_lifecycle: LifecycleState,
    to_status: AgentStatus,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    resumed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_states \
         SET lifecycle_state = $1, \
             status = $2, \
             started_at = COALESCE($3, started_at), \
             paused_at = COALESCE($4, paused_at), \
             resumed_at = COALESCE($5, resumed_at), \
             completed_at = COALESCE($6, completed_at), \
             last_error = COALESCE($7, last_error), \
             version = version + 1 \
         WHERE id = $8 AND version = $9",
    )
    .bind(to_lifecycle)
    .bind(to_status)
    .bind(started_at)
    .bind(paused_at)
    .bind(resumed_at)
    .bind(completed_at)
    .bind(last_error)
    .bind(agent_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to transition agent lifecycle state")?;

    Ok(result.rows_affected())
}

/// Same as [`transition_lifecycle_state`], but run within a caller-owned
/// transaction so the audit entry and version bump it's paired with commit
/// atomically with it.
#[allow(clippy::too_many_arguments)]
pub async fn transition_lifecycle_state_tx(
    tx: &mut Transaction<'_, Postgres>,
    agent_id: Uuid,
    expected_version: i64,
    to_lifecycle: LifecycleState,
    to_status: AgentStatus,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    resumed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_states \
         SET lifecycle_state = $1, \
             status = $2, \
             started_at = COALESCE($3, started_at), \
             paused_at = COALESCE($4, paused_at), \
             resumed_at = COALESCE($5, resumed_at), \
             completed_at = COALESCE($6, completed_at), \
             last_error = COALESCE($7, last_error), \
             version = version + 1 \
         WHERE id = $8 AND version = $9",
    )
    .bind(to_lifecycle)
    .bind(to_status)
    .bind(started_at)
    .bind(paused_at)
    .bind(resumed_at)
    .bind(completed_at)
    .bind(last_error)
    .bind(agent_id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to transition agent lifecycle state")?;

    Ok(result.rows_affected())
}

/// Increment `retry_count`, guarded by version. Caller has already checked
/// `retry_count < max_retries`.
pub async fn increment_retry_count(
    pool: &PgPool,
    agent_id: Uuid,
    expected_version: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_states \
         SET retry_count = retry_count + 1, version = version + 1 \
         WHERE id = $1 AND version = $2",
    )
    .bind(agent_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to increment agent retry count")?;

    Ok(result.rows_affected())
}

/// Append one entry to an agent's state history. `seq` must be the caller's
/// next sequence number for the agent (monotone, starting at 0).
pub async fn append_history(
    pool: &PgPool,
    agent_id: Uuid,
    seq: i64,
    from_state: Option<LifecycleState>,
    to_state: LifecycleState,
    metadata: Option<serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO agent_state_history (agent_id, seq, from_state, to_state, metadata) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(agent_id)
    .bind(seq)
    .bind(from_state)
    .bind(to_state)
    .bind(metadata)
    .execute(pool)
    .await
    .context("failed to append agent state history")?;

    Ok(())
}

/// Fetch an agent's full transition history, oldest first.
pub async fn get_history(
    pool: &PgPool,
    agent_id: Uuid,
) -> Result<Vec<crate::models::AgentStateHistoryEntry>> {
    let rows = sqlx::query_as::<_, crate::models::AgentStateHistoryEntry>(
        "SELECT * FROM agent_state_history WHERE agent_id = $1 ORDER BY seq ASC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch agent state history")?;

    Ok(rows)
}

/// Reset agents stuck in `spawning` or `running` back to `failed`.
///
/// Used during restart recovery: an interrupted agent cannot be trusted to
/// still be alive remotely, so it is retired rather than resumed.
/// Returns the agents that were reset.
pub async fn reset_orphaned_agents(pool: &PgPool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "UPDATE agent_states \
         SET lifecycle_state = 'failed', \
             status = 'failed', \
             last_error = 'interrupted by restart', \
             completed_at = NOW(), \
             version = version + 1 \
         WHERE lifecycle_state IN ('spawning', 'running') \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned agents")?;

    Ok(agents)
}

/// Overwrite every mutable column of an agent from a snapshot taken from a
/// prior audit entry, bumping `version` to `expected_version + 1`. Used by
/// `rollback`; `id`, `model`, and `task` are immutable and not touched.
pub async fn restore_snapshot_tx(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &Agent,
    expected_version: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_states \
         SET team_id = $1, parent_id = $2, session_id = $3, status = $4, lifecycle_state = $5, \
             metadata = $6, retry_count = $7, max_retries = $8, last_error = $9, \
             started_at = $10, paused_at = $11, resumed_at = $12, completed_at = $13, \
             runtime_ms = $14, version = $15 \
         WHERE id = $16 AND version = $17",
    )
    .bind(snapshot.team_id)
    .bind(snapshot.parent_id)
    .bind(&snapshot.session_id)
    .bind(snapshot.status)
    .bind(snapshot.lifecycle_state)
    .bind(&snapshot.metadata)
    .bind(snapshot.retry_count)
    .bind(snapshot.max_retries)
    .bind(&snapshot.last_error)
    .bind(snapshot.started_at)
    .bind(snapshot.paused_at)
    .bind(snapshot.resumed_at)
    .bind(snapshot.completed_at)
    .bind(snapshot.runtime_ms)
    .bind(expected_version + 1)
    .bind(snapshot.id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to restore agent snapshot")?;

    Ok(result.rows_affected())
}

/// All non-terminal agents for a team (used by scale-down selection).
pub async fn list_live_agents_for_team(pool: &PgPool, team_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agent_states \
         WHERE team_id = $1 \
           AND lifecycle_state NOT IN ('completed', 'failed', 'killed', 'stopped') \
         ORDER BY created_at DESC",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await
    .context("failed to list live agents for team")?;

    Ok(agents)
}
