//! Database query functions for the `team_states` and `team_agents` tables.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Team, TeamStatus};

/// Insert a new team row with `version = 0`.
pub async fn insert_team(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    config: serde_json::Value,
    budget_allocated: f64,
    budget_currency: &str,
    budget_max_tokens: Option<i64>,
) -> Result<Team> {
    let team = sqlx::query_as::<_, Team>(
        "INSERT INTO team_states \
            (id, name, status, config, budget_allocated, budget_currency, budget_max_tokens) \
         VALUES ($1, $2, 'creating', $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(config)
    .bind(budget_allocated)
    .bind(budget_currency)
    .bind(budget_max_tokens)
    .fetch_one(pool)
    .await
    .context("failed to insert team")?;

    Ok(team)
}

/// Fetch a single team by ID.
pub async fn get_team(pool: &PgPool, id: Uuid) -> Result<Option<Team>> {
    let team = sqlx::query_as::<_, Team>("SELECT * FROM team_states WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch team")?;

    Ok(team)
}

/// List all teams, optionally filtered by status, most recently created first.
pub async fn list_teams(pool: &PgPool, status: Option<TeamStatus>) -> Result<Vec<Team>> {
    let teams = match status {
        Some(status) => {
            sqlx::query_as::<_, Team>(
                "SELECT * FROM team_states WHERE status = $1 ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Team>("SELECT * FROM team_states ORDER BY created_at DESC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list teams")?;

    Ok(teams)
}

/// Atomically transition a team's status, guarded by its current version.
///
/// The UPDATE's WHERE clause includes `version = $expected`, so the row is
/// only updated if no other writer has touched it since the caller last
/// read it. Returns the number of rows affected (0 means a conflicting
/// write already landed).
pub async fn transition_team_status(
    pool: &PgPool,
    team_id: Uuid,
    expected_version: i64,
    to: TeamStatus,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE team_states \
         SET status = $1, \
             completed_at = COALESCE($2, completed_at), \
             version = version + 1 \
         WHERE id = $3 AND version = $4",
    )
    .bind(to)
    .bind(completed_at)
    .bind(team_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to transition team status")?;

    Ok(result.rows_affected())
}

/// Same as [`transition_team_status`], but run within a caller-owned
/// transaction so the paired audit entry commits atomically with it.
pub async fn transition_team_status_tx(
    tx: &mut Transaction<'_, Postgres>,
    team_id: Uuid,
    expected_version: i64,
    to: TeamStatus,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE team_states \
         SET status = $1, \
             completed_at = COALESCE($2, completed_at), \
             version = version + 1 \
         WHERE id = $3 AND version = $4",
    )
    .bind(to)
    .bind(completed_at)
    .bind(team_id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to transition team status")?;

    Ok(result.rows_affected())
}

/// Atomically apply a budget consumption delta, guarded by version.
///
/// Rejects (returns 0 rows affected, no write) when the new totals would
/// exceed `budget_allocated` or `budget_max_tokens`; the caller is expected
/// to have already checked those bounds against a consistent read, this is
/// the final compare-and-swap against the current row.
pub async fn consume_budget(
    pool: &PgPool,
    team_id: Uuid,
    expected_version: i64,
    cost: f64,
    tokens: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE team_states \
         SET budget_consumed = budget_consumed + $1, \
             budget_used_tokens = budget_used_tokens + $2, \
             version = version + 1 \
         WHERE id = $3 \
           AND version = $4 \
           AND budget_consumed + $1 <= budget_allocated \
           AND (budget_max_tokens IS NULL OR budget_used_tokens + $2 <= budget_max_tokens)",
    )
    .bind(cost)
    .bind(tokens)
    .bind(team_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to consume team budget")?;

    Ok(result.rows_affected())
}

/// Same as [`consume_budget`], but run within a caller-owned transaction.
pub async fn consume_budget_tx(
    tx: &mut Transaction<'_, Postgres>,
    team_id: Uuid,
    expected_version: i64,
    cost: f64,
    tokens: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE team_states \
         SET budget_consumed = budget_consumed + $1, \
             budget_used_tokens = budget_used_tokens + $2, \
             version = version + 1 \
         WHERE id = $3 \
           AND version = $4 \
           AND budget_consumed + $1 <= budget_allocated \
           AND (budget_max_tokens IS NULL OR budget_used_tokens + $2 <= budget_max_tokens)",
    )
    .bind(cost)
    .bind(tokens)
    .bind(team_id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to consume team budget")?;

    Ok(result.rows_affected())
}

/// Increment team metrics counters (total/completed/failed), guarded by version.
pub async fn bump_metrics(
    pool: &PgPool,
    team_id: Uuid,
    expected_version: i64,
    total_delta: i32,
    completed_delta: i32,
    failed_delta: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE team_states \
         SET metrics_total = metrics_total + $1, \
             metrics_completed = metrics_completed + $2, \
             metrics_failed = metrics_failed + $3, \
             version = version + 1 \
         WHERE id = $4 AND version = $5",
    )
    .bind(total_delta)
    .bind(completed_delta)
    .bind(failed_delta)
    .bind(team_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to bump team metrics")?;

    Ok(result.rows_affected())
}

/// Overwrite every mutable column of a team from a snapshot taken from a
/// prior audit entry, bumping `version` to `expected_version + 1`. Used by
/// `rollback`; `id` and `name` are immutable and not touched.
pub async fn restore_snapshot_tx(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &Team,
    expected_version: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE team_states \
         SET status = $1, config = $2, budget_allocated = $3, budget_consumed = $4, \
             budget_currency = $5, budget_max_tokens = $6, budget_used_tokens = $7, \
             metrics_total = $8, metrics_completed = $9, metrics_failed = $10, \
             completed_at = $11, version = $12 \
         WHERE id = $13 AND version = $14",
    )
    .bind(snapshot.status)
    .bind(&snapshot.config)
    .bind(snapshot.budget_allocated)
    .bind(snapshot.budget_consumed)
    .bind(&snapshot.budget_currency)
    .bind(snapshot.budget_max_tokens)
    .bind(snapshot.budget_used_tokens)
    .bind(snapshot.metrics_total)
    .bind(snapshot.metrics_completed)
    .bind(snapshot.metrics_failed)
    .bind(snapshot.completed_at)
    .bind(expected_version + 1)
    .bind(snapshot.id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to restore team snapshot")?;

    Ok(result.rows_affected())
}

/// Append an agent to a team's ordered membership list.
pub async fn add_team_agent(pool: &PgPool, team_id: Uuid, agent_id: Uuid) -> Result<()> {
    let position: (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM team_agents WHERE team_id = $1",
    )
    .bind(team_id)
    .fetch_one(pool)
    .await
    .context("failed to compute next team agent position")?;

    sqlx::query("INSERT INTO team_agents (team_id, agent_id, position) VALUES ($1, $2, $3)")
        .bind(team_id)
        .bind(agent_id)
        .bind(position.0 as i32)
        .execute(pool)
        .await
        .context("failed to add team agent")?;

    Ok(())
}

/// List the agent IDs belonging to a team, in membership order.
pub async fn list_team_agent_ids(pool: &PgPool, team_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT agent_id FROM team_agents WHERE team_id = $1 ORDER BY position ASC",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await
    .context("failed to list team agents")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Reset teams stuck in `creating` or `scaling` back to `active`.
///
/// Used during restart recovery: the interrupting operation is abandoned,
/// the team is left usable. Returns the teams that were reset.
pub async fn reset_interrupted_teams(pool: &PgPool) -> Result<Vec<Team>> {
    let teams = sqlx::query_as::<_, Team>(
        "UPDATE team_states \
         SET status = 'active', version = version + 1 \
         WHERE status IN ('creating', 'scaling') \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset interrupted teams")?;

    Ok(teams)
}

/// All non-terminal teams (used by recovery to republish state on startup).
pub async fn list_active_teams(pool: &PgPool) -> Result<Vec<Team>> {
    let teams = sqlx::query_as::<_, Team>(
        "SELECT * FROM team_states WHERE status NOT IN ('destroyed', 'completed', 'failed')",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active teams")?;

    Ok(teams)
}
