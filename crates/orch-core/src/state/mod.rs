//! Generic, version-guarded state transition engine shared by Agent
//! Lifecycle and Team Orchestrator.
//!
//! Generalizes `gator-core::state::TaskStateMachine::transition`'s
//! single-table optimistic-lock UPDATE to two transition tables (agent
//! lifecycle state, team status), each paired with an audit entry written
//! in the same transaction as the mutation.

pub mod dispatch;
pub mod rollback;

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use orch_db::models::{Agent, AgentStatus, AuditAction, LifecycleState, Team, TeamStatus};
use orch_db::queries::{agents, audit, teams, versions};

use crate::clock::new_id;
use crate::error::OrchError;

/// Backoff applied between optimistic-lock compare attempts, per the
/// `base * 2^attempt` capped-with-jitter shape used by the reconnect
/// backoff in `orch-gateway`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self
            .initial_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(20))
            .min(self.max_delay.as_millis());
        let jitter_ms = rand::rng().random_range(0..=(base_ms / 5).max(1));
        Duration::from_millis((base_ms + jitter_ms) as u64)
    }
}

/// Valid `(from, to)` edges for an agent's `lifecycle_state`. Any pair not
/// in this table is refused with `StateConflict`.
pub fn is_valid_agent_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (Initializing, Spawning)
            | (Initializing, Failed)
            | (Spawning, Running)
            | (Spawning, Failed)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Killed)
            | (Paused, Running)
            | (Paused, Killed)
            | (Paused, Failed)
            | (Failed, Spawning)
            | (Failed, Killed)
    )
}

/// Valid `(from, to)` edges for a team's `status`.
pub fn is_valid_team_transition(from: TeamStatus, to: TeamStatus) -> bool {
    use TeamStatus::*;
    matches!(
        (from, to),
        (Creating, Active)
            | (Creating, Failed)
            | (Active, Scaling)
            | (Active, Paused)
            | (Active, Destroyed)
            | (Active, Completed)
            | (Active, Failed)
            | (Scaling, Active)
            | (Scaling, Failed)
            | (Paused, Active)
            | (Paused, Destroyed)
    )
}

/// The user-visible `status` implied by a `lifecycle_state`, per §3's
/// status/lifecycle_state pairing.
pub fn status_for_lifecycle(state: LifecycleState) -> AgentStatus {
    match state {
        LifecycleState::Initializing | LifecycleState::Spawning => AgentStatus::Pending,
        LifecycleState::Running => AgentStatus::Running,
        LifecycleState::Paused => AgentStatus::Paused,
        LifecycleState::Completed => AgentStatus::Completed,
        LifecycleState::Failed => AgentStatus::Failed,
        LifecycleState::Killed | LifecycleState::Stopped => AgentStatus::Killed,
    }
}

/// Record an `action="error"` audit entry for a failed mutation: the
/// offending inputs (`metadata`) plus the error kind, per §7's "every failed
/// mutation leaves an audit entry" requirement. Best-effort: a failure here
/// is logged, not propagated, so a broken audit write can't mask the
/// original error it was trying to record.
pub async fn record_error_audit(
    pool: &PgPool,
    entity_type: &str,
    entity_id: Uuid,
    triggered_by: &str,
    err: &OrchError,
    mut metadata: serde_json::Value,
) {
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("error_kind".into(), serde_json::json!(err.kind()));
        obj.insert("error".into(), serde_json::json!(err.to_string()));
    }

    if let Err(e) = audit::insert(
        pool,
        new_id(),
        entity_type,
        entity_id,
        AuditAction::Error,
        None,
        None,
        triggered_by,
        Some(metadata),
    )
    .await
    {
        tracing::warn!(error = %e, entity_type, %entity_id, "failed to record error audit entry");
    }
}

/// Everything a caller may want to set when driving an agent transition.
#[derive(Debug, Clone, Default)]
pub struct AgentTransitionRequest {
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub triggered_by: String,
    pub metadata: Option<serde_json::Value>,
}

/// Drive one agent transition under the optimistic-lock retry protocol of
/// §4.3: validate, attempt the version-guarded UPDATE, and on a version
/// mismatch re-read and retry with backoff up to `policy.max_attempts`.
pub async fn apply_agent_transition(
    pool: &PgPool,
    agent_id: Uuid,
    to: LifecycleState,
    req: &AgentTransitionRequest,
    policy: &RetryPolicy,
) -> Result<Agent, OrchError> {
    let mut current = agents::get_agent(pool, agent_id)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?
        .ok_or(OrchError::NotFound {
            entity_type: "agent",
            id: agent_id,
        })?;

    for attempt in 0..policy.max_attempts {
        if !is_valid_agent_transition(current.lifecycle_state, to) {
            let err = OrchError::StateConflict {
                entity_type: "agent",
                id: agent_id,
                from: current.lifecycle_state.to_string(),
                to: to.to_string(),
            };
            record_error_audit(
                pool,
                "agent",
                agent_id,
                &req.triggered_by,
                &err,
                serde_json::json!({"requested_to": to.to_string()}),
            )
            .await;
            return Err(err);
        }

        let to_status = status_for_lifecycle(to);
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

        let rows = agents::transition_lifecycle_state_tx(
            &mut tx,
            agent_id,
            current.version,
            to,
            to_status,
            req.started_at,
            req.paused_at,
            req.resumed_at,
            req.completed_at,
            req.last_error.as_deref(),
        )
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

        if rows == 1 {
            let mut next = current.clone();
            next.lifecycle_state = to;
            next.status = to_status;
            next.version = current.version + 1;
            if let Some(t) = req.started_at {
                next.started_at = Some(t);
            }
            if let Some(t) = req.paused_at {
                next.paused_at = Some(t);
            }
            if let Some(t) = req.resumed_at {
                next.resumed_at = Some(t);
            }
            if let Some(t) = req.completed_at {
                next.completed_at = Some(t);
            }
            if let Some(ref err) = req.last_error {
                next.last_error = Some(err.clone());
            }

            let prev_json = serde_json::to_value(&current).ok();
            let next_json = serde_json::to_value(&next).ok();

            audit::insert_tx(
                &mut tx,
                new_id(),
                "agent",
                agent_id,
                AuditAction::Update,
                prev_json,
                next_json,
                &req.triggered_by,
                req.metadata.clone(),
            )
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

            versions::set_version(&mut tx, "agent", agent_id, next.version)
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;

            agents::append_history(
                pool,
                agent_id,
                next.version,
                Some(current.lifecycle_state),
                to,
                req.metadata.clone(),
            )
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

            tracing::info!(
                agent_id = %agent_id,
                from = %current.lifecycle_state,
                to = %to,
                "agent transition applied"
            );
            return Ok(next);
        }

        // Version mismatch: roll back and re-read for the next attempt.
        tx.rollback()
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

        tracing::warn!(
            agent_id = %agent_id,
            attempt,
            expected_version = current.version,
            "optimistic lock conflict, retrying"
        );

        current = agents::get_agent(pool, agent_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?
            .ok_or(OrchError::NotFound {
                entity_type: "agent",
                id: agent_id,
            })?;

        tokio::time::sleep(policy.delay_for(attempt)).await;
    }

    let err = OrchError::OptimisticLock {
        entity_type: "agent",
        id: agent_id,
        expected: current.version,
        actual: current.version,
    };
    record_error_audit(
        pool,
        "agent",
        agent_id,
        &req.triggered_by,
        &err,
        serde_json::json!({"requested_to": to.to_string(), "attempts": policy.max_attempts}),
    )
    .await;
    Err(err)
}

/// Drive one team status transition under the same optimistic-lock retry
/// protocol as [`apply_agent_transition`].
pub async fn apply_team_transition(
    pool: &PgPool,
    team_id: Uuid,
    to: TeamStatus,
    completed_at: Option<DateTime<Utc>>,
    triggered_by: &str,
    metadata: Option<serde_json::Value>,
    policy: &RetryPolicy,
) -> Result<Team, OrchError> {
    let mut current = teams::get_team(pool, team_id)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?
        .ok_or(OrchError::NotFound {
            entity_type: "team",
            id: team_id,
        })?;

    for attempt in 0..policy.max_attempts {
        if !is_valid_team_transition(current.status, to) {
            let err = OrchError::StateConflict {
                entity_type: "team",
                id: team_id,
                from: current.status.to_string(),
                to: to.to_string(),
            };
            record_error_audit(
                pool,
                "team",
                team_id,
                triggered_by,
                &err,
                serde_json::json!({"requested_to": to.to_string()}),
            )
            .await;
            return Err(err);
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

        let rows = teams::transition_team_status_tx(&mut tx, team_id, current.version, to, completed_at)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

        if rows == 1 {
            let mut next = current.clone();
            next.status = to;
            next.version = current.version + 1;
            if let Some(t) = completed_at {
                next.completed_at = Some(t);
            }

            let prev_json = serde_json::to_value(&current).ok();
            let next_json = serde_json::to_value(&next).ok();

            audit::insert_tx(
                &mut tx,
                new_id(),
                "team",
                team_id,
                AuditAction::Update,
                prev_json,
                next_json,
                triggered_by,
                metadata.clone(),
            )
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

            versions::set_version(&mut tx, "team", team_id, next.version)
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;

            tracing::info!(team_id = %team_id, from = %current.status, to = %to, "team transition applied");
            return Ok(next);
        }

        tx.rollback()
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

        tracing::warn!(team_id = %team_id, attempt, "optimistic lock conflict, retrying");

        current = teams::get_team(pool, team_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?
            .ok_or(OrchError::NotFound {
                entity_type: "team",
                id: team_id,
            })?;

        tokio::time::sleep(policy.delay_for(attempt)).await;
    }

    let err = OrchError::OptimisticLock {
        entity_type: "team",
        id: team_id,
        expected: current.version,
        actual: current.version,
    };
    record_error_audit(
        pool,
        "team",
        team_id,
        triggered_by,
        &err,
        serde_json::json!({"requested_to": to.to_string(), "attempts": policy.max_attempts}),
    )
    .await;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_transition_table_matches_spec() {
        use LifecycleState::*;
        assert!(is_valid_agent_transition(Initializing, Spawning));
        assert!(is_valid_agent_transition(Failed, Spawning));
        assert!(!is_valid_agent_transition(Completed, Running));
        assert!(!is_valid_agent_transition(Killed, Spawning));
        assert!(!is_valid_agent_transition(Running, Initializing));
    }

    #[test]
    fn team_transition_table_matches_spec() {
        use TeamStatus::*;
        assert!(is_valid_team_transition(Creating, Active));
        assert!(is_valid_team_transition(Active, Scaling));
        assert!(!is_valid_team_transition(Destroyed, Active));
        assert!(!is_valid_team_transition(Completed, Scaling));
    }

    #[test]
    fn status_mirrors_lifecycle() {
        assert_eq!(
            status_for_lifecycle(LifecycleState::Running),
            AgentStatus::Running
        );
        assert_eq!(
            status_for_lifecycle(LifecycleState::Stopped),
            AgentStatus::Killed
        );
    }
}
