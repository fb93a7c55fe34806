//! Named wrappers over [`super::apply_agent_transition`] /
//! [`super::apply_team_transition`], the same split
//! `gator-core::state::dispatch` draws over `TaskStateMachine::transition`.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use orch_db::models::{LifecycleState, TeamStatus};

use super::{apply_agent_transition, apply_team_transition, AgentTransitionRequest, RetryPolicy};
use crate::error::OrchError;

/// `initializing -> spawning`.
pub async fn begin_spawn(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Spawning, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `spawning -> running`.
pub async fn mark_running(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        started_at: Some(Utc::now()),
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Running, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `running -> paused`.
pub async fn pause(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        paused_at: Some(Utc::now()),
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Paused, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `paused -> running`.
pub async fn resume(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        resumed_at: Some(Utc::now()),
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Running, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `{running, paused, spawning, initializing} -> killed`.
pub async fn kill(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        completed_at: Some(Utc::now()),
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Killed, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `{running, paused, spawning, initializing} -> failed`.
pub async fn fail(
    pool: &PgPool,
    agent_id: Uuid,
    triggered_by: &str,
    last_error: &str,
) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        completed_at: Some(Utc::now()),
        last_error: Some(last_error.to_owned()),
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Failed, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `running -> completed`.
pub async fn complete(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        completed_at: Some(Utc::now()),
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Completed, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `failed -> spawning`, the retry edge. Caller has already checked
/// `retry_count < max_retries` and incremented the counter.
pub async fn retry(pool: &PgPool, agent_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    let req = AgentTransitionRequest {
        last_error: None,
        triggered_by: triggered_by.to_owned(),
        ..Default::default()
    };
    apply_agent_transition(pool, agent_id, LifecycleState::Spawning, &req, &RetryPolicy::default()).await?;
    Ok(())
}

/// `creating -> active`.
pub async fn activate_team(pool: &PgPool, team_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    apply_team_transition(pool, team_id, TeamStatus::Active, None, triggered_by, None, &RetryPolicy::default()).await?;
    Ok(())
}

/// `active -> scaling`.
pub async fn begin_scale(pool: &PgPool, team_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    apply_team_transition(pool, team_id, TeamStatus::Scaling, None, triggered_by, None, &RetryPolicy::default()).await?;
    Ok(())
}

/// `scaling -> active`.
pub async fn end_scale(pool: &PgPool, team_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    apply_team_transition(pool, team_id, TeamStatus::Active, None, triggered_by, None, &RetryPolicy::default()).await?;
    Ok(())
}

/// `active -> paused`.
pub async fn pause_team(pool: &PgPool, team_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    apply_team_transition(pool, team_id, TeamStatus::Paused, None, triggered_by, None, &RetryPolicy::default()).await?;
    Ok(())
}

/// `paused -> active`.
pub async fn resume_team(pool: &PgPool, team_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    apply_team_transition(pool, team_id, TeamStatus::Active, None, triggered_by, None, &RetryPolicy::default()).await?;
    Ok(())
}

/// `{active, paused} -> destroyed`.
pub async fn destroy_team(pool: &PgPool, team_id: Uuid, triggered_by: &str) -> Result<(), OrchError> {
    apply_team_transition(
        pool,
        team_id,
        TeamStatus::Destroyed,
        Some(Utc::now()),
        triggered_by,
        None,
        &RetryPolicy::default(),
    )
    .await?;
    Ok(())
}
