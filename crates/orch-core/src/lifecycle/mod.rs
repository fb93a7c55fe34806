//! Agent lifecycle manager: spawn, pause, resume, kill, retry, and the
//! gateway-event-driven transitions for one agent's state machine.
//!
//! Per-agent mutexes are acquired for the shortest span that covers the
//! read-check-write of a single transition, generalizing the single global
//! task table `gator-core::state::TaskStateMachine::transition` used to a
//! per-agent in-memory mutex layered on top of the DB-level optimistic lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use orch_db::models::{Agent, AuditAction, LifecycleState};
use orch_db::queries::{agents, audit};
use orch_gateway::{protocol::AgentEventStatus, GatewayClient, GatewayEvent};

use crate::clock::new_id;
use crate::error::OrchError;
use crate::event_bus::EventBus;
use crate::state::dispatch;

/// Parameters for [`LifecycleManager::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub team_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub model: String,
    pub task: String,
    pub metadata: serde_json::Value,
    pub max_retries: i32,
}

/// Per-agent runtime metrics, computed from persisted state.
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    pub retry_count: i32,
    pub max_retries: i32,
    pub runtime_ms: i64,
    pub transitions: i64,
}

fn topic_for(agent_id: Uuid) -> String {
    format!("agent:{agent_id}")
}

/// Owns gateway session binding and the per-agent mutex registry for every
/// agent this process touches.
pub struct LifecycleManager {
    pool: PgPool,
    gateway: GatewayClient,
    events: EventBus,
    strict: bool,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(pool: PgPool, gateway: GatewayClient, events: EventBus, strict: bool) -> Self {
        Self {
            pool,
            gateway,
            events,
            strict,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, agent_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run startup (no background tasks owned directly by the lifecycle
    /// manager today; reserved so an embedding binary has a single place to
    /// call into before serving requests).
    pub async fn start(&self) {
        tracing::info!("agent lifecycle manager started");
    }

    /// Graceful shutdown hook, mirrored by [`Self::start`].
    pub async fn stop(&self) {
        tracing::info!("agent lifecycle manager stopped");
    }

    /// Assign an id, persist `pending/initializing`, then spawn a remote
    /// gateway session and transition through `spawning -> running`.
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<Agent, OrchError> {
        let id = new_id();
        let created = agents::insert_agent(
            &self.pool,
            id,
            opts.team_id,
            opts.parent_id,
            &opts.model,
            &opts.task,
            opts.metadata.clone(),
            opts.max_retries,
        )
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

        audit::insert(
            &self.pool,
            new_id(),
            "agent",
            id,
            AuditAction::Create,
            None,
            serde_json::to_value(&created).ok(),
            "lifecycle.spawn",
            None,
        )
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        self.bring_up(id, &opts.model, "lifecycle.spawn").await
    }

    /// Shared `spawning -> running` sequence used by both [`Self::spawn`]
    /// and [`Self::retry`]: attempt a gateway session, then transition.
    async fn bring_up(&self, id: Uuid, model: &str, triggered_by: &str) -> Result<Agent, OrchError> {
        dispatch::begin_spawn(&self.pool, id, triggered_by).await?;

        match self.gateway.sessions_spawn(model, None).await {
            Ok(session_key) => {
                agents::bind_session(&self.pool, id, &session_key)
                    .await
                    .map_err(|e| OrchError::Internal(e.to_string()))?;
                dispatch::mark_running(&self.pool, id, triggered_by).await?;
                self.events.publish(
                    &topic_for(id),
                    serde_json::json!({"event": "running", "session_key": session_key}),
                );
            }
            Err(e) if self.strict => {
                let msg = e.to_string();
                dispatch::fail(&self.pool, id, triggered_by, &msg).await?;
                self.events
                    .publish(&topic_for(id), serde_json::json!({"event": "failed", "error": msg}));
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(agent_id = %id, error = %e, "gateway unavailable, spawning in degraded mode");
                dispatch::mark_running(&self.pool, id, triggered_by).await?;
                self.events
                    .publish(&topic_for(id), serde_json::json!({"event": "running", "degraded": true}));
            }
        }

        self.fetch(id).await
    }

    pub async fn pause(&self, agent_id: Uuid) -> Result<Agent, OrchError> {
        let lock = self.lock_for(agent_id).await;
        let _guard = lock.lock().await;
        dispatch::pause(&self.pool, agent_id, "lifecycle.pause").await?;
        self.events.publish(&topic_for(agent_id), serde_json::json!({"event": "paused"}));
        self.fetch(agent_id).await
    }

    pub async fn resume(&self, agent_id: Uuid) -> Result<Agent, OrchError> {
        let lock = self.lock_for(agent_id).await;
        let _guard = lock.lock().await;
        dispatch::resume(&self.pool, agent_id, "lifecycle.resume").await?;
        self.events.publish(&topic_for(agent_id), serde_json::json!({"event": "resumed"}));
        self.fetch(agent_id).await
    }

    /// Kill an agent. `force` bypasses waiting on gateway acknowledgement
    /// (a best-effort `sessions_kill` is still issued).
    pub async fn kill(&self, agent_id: Uuid, force: bool) -> Result<Agent, OrchError> {
        let lock = self.lock_for(agent_id).await;
        let _guard = lock.lock().await;

        let agent = self.fetch(agent_id).await?;
        if let Some(session_key) = agent.session_id.as_deref() {
            if let Err(e) = self.gateway.sessions_kill(session_key).await {
                if force {
                    tracing::warn!(agent_id = %agent_id, error = %e, "best-effort session kill failed, killing locally anyway");
                } else {
                    return Err(e.into());
                }
            }
        }

        dispatch::kill(&self.pool, agent_id, "lifecycle.kill").await?;
        agents::clear_session(&self.pool, agent_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;
        self.events.publish(&topic_for(agent_id), serde_json::json!({"event": "killed"}));
        self.fetch(agent_id).await
    }

    /// Retry a `failed` agent. Fails with `RetryExhausted` once
    /// `retry_count >= max_retries`.
    pub async fn retry(&self, agent_id: Uuid) -> Result<Agent, OrchError> {
        let lock = self.lock_for(agent_id).await;
        let _guard = lock.lock().await;

        let agent = self.fetch(agent_id).await?;
        if agent.lifecycle_state != LifecycleState::Failed {
            return Err(OrchError::StateConflict {
                entity_type: "agent",
                id: agent_id,
                from: agent.lifecycle_state.to_string(),
                to: LifecycleState::Spawning.to_string(),
            });
        }
        if agent.retry_count >= agent.max_retries {
            let err = OrchError::RetryExhausted {
                agent_id,
                retry_count: agent.retry_count,
                max_retries: agent.max_retries,
            };
            crate::state::record_error_audit(
                &self.pool,
                "agent",
                agent_id,
                "lifecycle.retry",
                &err,
                serde_json::json!({"retry_count": agent.retry_count, "max_retries": agent.max_retries}),
            )
            .await;
            return Err(err);
        }

        let rows = agents::increment_retry_count(&self.pool, agent_id, agent.version)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;
        if rows == 0 {
            return Err(OrchError::OptimisticLock {
                entity_type: "agent",
                id: agent_id,
                expected: agent.version,
                actual: agent.version,
            });
        }

        self.bring_up(agent_id, &agent.model, "lifecycle.retry").await
    }

    pub async fn get_state(&self, agent_id: Uuid) -> Result<Agent, OrchError> {
        self.fetch(agent_id).await
    }

    pub async fn get_metrics(&self, agent_id: Uuid) -> Result<AgentMetrics, OrchError> {
        let agent = self.fetch(agent_id).await?;
        let history = agents::get_history(&self.pool, agent_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;
        Ok(AgentMetrics {
            retry_count: agent.retry_count,
            max_retries: agent.max_retries,
            runtime_ms: agent.runtime_ms,
            transitions: history.len() as i64,
        })
    }

    /// Run an operation with a deadline; the operation's own state is left
    /// untouched if the deadline elapses (callers decide whether to retry
    /// or kill).
    pub async fn with_deadline<F, T>(&self, agent_id: Uuid, deadline: Duration, op: F) -> Result<T, OrchError>
    where
        F: std::future::Future<Output = Result<T, OrchError>>,
    {
        match tokio::time::timeout(deadline, op).await {
            Ok(result) => result,
            Err(_) => Err(OrchError::Timeout {
                entity_type: "agent",
                id: agent_id,
                elapsed: deadline,
            }),
        }
    }

    async fn fetch(&self, agent_id: Uuid) -> Result<Agent, OrchError> {
        agents::get_agent(&self.pool, agent_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?
            .ok_or(OrchError::NotFound {
                entity_type: "agent",
                id: agent_id,
            })
    }
}

/// Background task: apply the gateway-event-to-lifecycle-transition mapping
/// of §6.1. Unknown session keys are dropped silently.
///
/// `AgentEventStatus::Failed` is handled separately from the rest: three
/// successive failures for the same agent must retry after the first two
/// (bumping `retry_count`) and go terminal only on the third, per §8
/// scenario 3. The session isn't cleared until the agent is actually
/// terminal, since clearing it first would make `get_agent_by_session`
/// unable to resolve the agent for a later failure on the same session.
pub async fn run_gateway_event_loop(
    pool: PgPool,
    lifecycle: Arc<LifecycleManager>,
    events: EventBus,
    mut rx: mpsc::Receiver<GatewayEvent>,
) {
    while let Some(event) = rx.recv().await {
        let GatewayEvent::Agent(agent_event) = event else {
            continue;
        };

        let agent = match agents::get_agent_by_session(&pool, &agent_event.session_key).await {
            Ok(Some(agent)) => agent,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to resolve agent for gateway event");
                continue;
            }
        };

        if matches!(agent_event.status, AgentEventStatus::Failed) {
            if let Err(e) = dispatch::fail(&pool, agent.id, "gateway", "gateway reported failure").await {
                tracing::warn!(agent_id = %agent.id, error = %e, "failed to apply gateway-driven transition");
                continue;
            }

            if agent.retry_count < agent.max_retries {
                if let Err(e) = lifecycle.retry(agent.id).await {
                    tracing::warn!(agent_id = %agent.id, error = %e, "automatic retry after gateway failure did not succeed, agent left terminal");
                    let _ = agents::clear_session(&pool, agent.id).await;
                }
            } else {
                let _ = agents::clear_session(&pool, agent.id).await;
            }

            events.publish(
                &topic_for(agent.id),
                serde_json::json!({"event": "gateway", "status": format!("{:?}", agent_event.status)}),
            );
            continue;
        }

        let result = match agent_event.status {
            AgentEventStatus::Spawned => Ok(()),
            AgentEventStatus::Running => {
                if agent.lifecycle_state == LifecycleState::Spawning {
                    dispatch::mark_running(&pool, agent.id, "gateway").await
                } else {
                    Ok(())
                }
            }
            AgentEventStatus::Completed => {
                let r = dispatch::complete(&pool, agent.id, "gateway").await;
                let _ = agents::clear_session(&pool, agent.id).await;
                r
            }
            AgentEventStatus::Failed => unreachable!("handled above"),
            AgentEventStatus::Killed => {
                let r = dispatch::kill(&pool, agent.id, "gateway").await;
                let _ = agents::clear_session(&pool, agent.id).await;
                r
            }
            AgentEventStatus::Paused => dispatch::pause(&pool, agent.id, "gateway").await,
            AgentEventStatus::Resumed => dispatch::resume(&pool, agent.id, "gateway").await,
        };

        if let Err(e) = result {
            tracing::warn!(agent_id = %agent.id, error = %e, "failed to apply gateway-driven transition");
            continue;
        }

        events.publish(
            &topic_for(agent.id),
            serde_json::json!({"event": "gateway", "status": format!("{:?}", agent_event.status)}),
        );
    }
}
