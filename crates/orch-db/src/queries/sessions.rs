//! Database query functions for the `session_states` table.
//!
//! Gateway sessions are process-local in the live path (held in memory by
//! `orch-gateway`); the durable rows here exist only so that restart
//! recovery has something to reconcile against.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::SessionState;

/// Insert or update a session row.
pub async fn upsert_session(
    pool: &PgPool,
    session_key: &str,
    agent_id: uuid::Uuid,
    status: &str,
    metadata: serde_json::Value,
) -> Result<SessionState> {
    let session = sqlx::query_as::<_, SessionState>(
        "INSERT INTO session_states (session_key, agent_id, status, metadata) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (session_key) DO UPDATE \
             SET status = EXCLUDED.status, metadata = EXCLUDED.metadata \
         RETURNING *",
    )
    .bind(session_key)
    .bind(agent_id)
    .bind(status)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to upsert session")?;

    Ok(session)
}

/// Mark a session completed.
pub async fn complete_session(pool: &PgPool, session_key: &str, status: &str) -> Result<()> {
    sqlx::query(
        "UPDATE session_states SET status = $1, completed_at = NOW() WHERE session_key = $2",
    )
    .bind(status)
    .bind(session_key)
    .execute(pool)
    .await
    .context("failed to complete session")?;

    Ok(())
}

/// Fetch a session by key.
pub async fn get_session(pool: &PgPool, session_key: &str) -> Result<Option<SessionState>> {
    let session =
        sqlx::query_as::<_, SessionState>("SELECT * FROM session_states WHERE session_key = $1")
            .bind(session_key)
            .fetch_optional(pool)
            .await
            .context("failed to fetch session")?;

    Ok(session)
}

/// List all sessions that are not yet completed, for startup reconciliation.
pub async fn list_open_sessions(pool: &PgPool) -> Result<Vec<SessionState>> {
    let sessions = sqlx::query_as::<_, SessionState>(
        "SELECT * FROM session_states WHERE completed_at IS NULL",
    )
    .fetch_all(pool)
    .await
    .context("failed to list open sessions")?;

    Ok(sessions)
}
