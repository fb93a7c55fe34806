//! Team orchestrator: team creation, scaling, budget accounting, and
//! coordinated destroy. Mutations of a single team are serialized by a
//! per-team mutex keyed by `team_id`; reads are lock-free.
//!
//! The scale/destroy concurrency shape (bounded-parallelism fan-out,
//! `tokio::sync::mpsc` fan-in of per-agent outcomes) generalizes
//! `gator-core::orchestrator::run_orchestrator`'s DAG-scheduling loop: its
//! `Semaphore`-bounded `tokio::spawn` per ready task and `LifecycleDone`
//! fan-in message become, here, the bounded-parallelism kill/spawn fan-out
//! used by scale and destroy. The loop itself (there is no DAG to schedule)
//! is not kept, only the concurrency primitives it used.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex, Semaphore};
use uuid::Uuid;

use orch_db::models::{AuditAction, Team, TeamStatus};
use orch_db::queries::{audit, checkpoints, teams};

use crate::clock::new_id;
use crate::error::OrchError;
use crate::event_bus::EventBus;
use crate::lifecycle::{LifecycleManager, SpawnOptions};
use crate::state::dispatch;

const MAX_PARALLEL_FANOUT: usize = 8;
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);
const BUDGET_WARNING_THRESHOLD: f64 = 0.8;
const BUDGET_CRITICAL_THRESHOLD: f64 = 0.95;

/// Parameters for [`TeamOrchestrator::create`].
#[derive(Debug, Clone)]
pub struct TeamCreateConfig {
    pub name: String,
    pub config: serde_json::Value,
    pub budget_allocated: f64,
    pub budget_currency: String,
    pub budget_max_tokens: Option<i64>,
    pub initial_agents: usize,
    pub max_agents: usize,
    pub default_model: String,
    pub default_task: String,
    pub agent_max_retries: i32,
}

/// Outcome of a `scale` call when every spawn/kill succeeded.
#[derive(Debug, Clone)]
pub struct ScaleOutcome {
    pub team: Team,
    pub created: Vec<Uuid>,
    pub killed: Vec<Uuid>,
}

fn topic_for(team_id: Uuid) -> String {
    format!("team:{team_id}")
}

fn max_agents_of(team: &Team) -> usize {
    team.config
        .get("max_agents")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::MAX) as usize
}

pub struct TeamOrchestrator {
    pool: PgPool,
    lifecycle: Arc<LifecycleManager>,
    events: EventBus,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TeamOrchestrator {
    pub fn new(pool: PgPool, lifecycle: Arc<LifecycleManager>, events: EventBus) -> Self {
        Self {
            pool,
            lifecycle,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, team_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(team_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_team(&self, team_id: Uuid) -> Result<Team, OrchError> {
        teams::get_team(&self.pool, team_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?
            .ok_or(OrchError::NotFound {
                entity_type: "team",
                id: team_id,
            })
    }

    pub async fn list_teams(&self, status: Option<TeamStatus>) -> Result<Vec<Team>, OrchError> {
        teams::list_teams(&self.pool, status)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))
    }

    /// Create a team, spawn its initial agents, and activate it.
    pub async fn create(&self, config: TeamCreateConfig) -> Result<Team, OrchError> {
        let id = new_id();
        let mut team_config = config.config.clone();
        if let Some(obj) = team_config.as_object_mut() {
            obj.insert("max_agents".into(), serde_json::json!(config.max_agents));
            obj.insert("default_model".into(), serde_json::json!(config.default_model));
            obj.insert("default_task".into(), serde_json::json!(config.default_task));
        }

        let created_team = teams::insert_team(
            &self.pool,
            id,
            &config.name,
            team_config,
            config.budget_allocated,
            &config.budget_currency,
            config.budget_max_tokens,
        )
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

        audit::insert(
            &self.pool,
            new_id(),
            "team",
            id,
            AuditAction::Create,
            None,
            serde_json::to_value(&created_team).ok(),
            "orchestrator.create",
            None,
        )
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?;

        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let spawned = self
            .spawn_n(id, config.initial_agents, &config.default_model, &config.default_task, config.agent_max_retries)
            .await;

        for agent_id in &spawned.created {
            teams::add_team_agent(&self.pool, id, *agent_id)
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;
        }
        teams::bump_metrics(&self.pool, id, 0, spawned.created.len() as i32, 0, 0)
            .await
            .ok();

        dispatch::activate_team(&self.pool, id, "orchestrator.create").await?;

        self.events.publish(&topic_for(id), serde_json::json!({"event": "created", "agents": spawned.created.len()}));

        self.get_team(id).await
    }

    /// Spawn `n` agents for a team with bounded parallelism, collecting
    /// successes and per-agent error strings.
    async fn spawn_n(
        &self,
        team_id: Uuid,
        n: usize,
        model: &str,
        task: &str,
        max_retries: i32,
    ) -> FanoutResult {
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_FANOUT.min(n.max(1))));
        let (tx, mut rx) = mpsc::channel(n.max(1));

        for _ in 0..n {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let lifecycle = self.lifecycle.clone();
            let tx = tx.clone();
            let model = model.to_owned();
            let task = task.to_owned();

            tokio::spawn(async move {
                let opts = SpawnOptions {
                    team_id: Some(team_id),
                    parent_id: None,
                    model,
                    task,
                    metadata: serde_json::json!({}),
                    max_retries,
                };
                let result = lifecycle.spawn(opts).await;
                drop(permit);
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut created = Vec::new();
        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(agent) => created.push(agent.id),
                Err(e) => errors.push(e.to_string()),
            }
        }

        FanoutResult { created, errors }
    }

    /// Kill `agent_ids` with bounded parallelism. Waits up to
    /// `KILL_GRACE_PERIOD` for a graceful kill before escalating to
    /// `force=true`.
    async fn kill_n(&self, agent_ids: Vec<Uuid>) -> FanoutResult {
        let n = agent_ids.len();
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_FANOUT.min(n.max(1))));
        let (tx, mut rx) = mpsc::channel(n.max(1));

        for agent_id in agent_ids {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let lifecycle = self.lifecycle.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = match tokio::time::timeout(KILL_GRACE_PERIOD, lifecycle.kill(agent_id, false)).await {
                    Ok(r) => r,
                    Err(_) => lifecycle.kill(agent_id, true).await,
                };
                drop(permit);
                let _ = tx.send((agent_id, result)).await;
            });
        }
        drop(tx);

        let mut created = Vec::new();
        let mut errors = Vec::new();
        while let Some((agent_id, result)) = rx.recv().await {
            match result {
                Ok(_) => created.push(agent_id),
                Err(e) => errors.push(format!("{agent_id}: {e}")),
            }
        }

        FanoutResult { created, errors }
    }

    /// Scale a team to `target` live agents.
    pub async fn scale(&self, team_id: Uuid, target: usize) -> Result<ScaleOutcome, OrchError> {
        let lock = self.lock_for(team_id).await;
        let _guard = lock.lock().await;

        let team = self.get_team(team_id).await?;
        if matches!(team.status, TeamStatus::Destroyed | TeamStatus::Completed | TeamStatus::Failed) {
            return Err(OrchError::StateConflict {
                entity_type: "team",
                id: team_id,
                from: team.status.to_string(),
                to: "scaling".to_owned(),
            });
        }

        let max_agents = max_agents_of(&team);
        if target > max_agents {
            return Err(OrchError::StateConflict {
                entity_type: "team",
                id: team_id,
                from: format!("max_agents={max_agents}"),
                to: format!("target={target}"),
            });
        }

        dispatch::begin_scale(&self.pool, team_id, "orchestrator.scale").await?;

        let live = orch_db::queries::agents::list_live_agents_for_team(&self.pool, team_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;
        let cur = live.len();

        let (created, killed, errors) = if target > cur {
            let spawned = self
                .spawn_n(team_id, target - cur, &default_model_of(&team), &default_task_of(&team), 3)
                .await;
            for agent_id in &spawned.created {
                teams::add_team_agent(&self.pool, team_id, *agent_id)
                    .await
                    .map_err(|e| OrchError::Internal(e.to_string()))?;
            }
            (spawned.created, Vec::new(), spawned.errors)
        } else if target < cur {
            let mut ordered = live;
            ordered.sort_by_key(|a| std::cmp::Reverse(a.created_at));
            let victims: Vec<Uuid> = ordered.into_iter().take(cur - target).map(|a| a.id).collect();
            let outcome = self.kill_n(victims).await;
            (Vec::new(), outcome.created, outcome.errors)
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        teams::bump_metrics(&self.pool, team_id, team.version + 1, created.len() as i32, 0, 0)
            .await
            .ok();

        dispatch::end_scale(&self.pool, team_id, "orchestrator.scale").await?;
        self.events
            .publish(&topic_for(team_id), serde_json::json!({"event": "scaled", "target": target}));

        let team = self.get_team(team_id).await?;

        if !errors.is_empty() {
            return Err(OrchError::PartialScale { created, errors });
        }

        Ok(ScaleOutcome { team, created, killed })
    }

    /// Destroy a team: kill every non-terminal member and mark the team
    /// terminal. Idempotent: a second call writes an audit entry but makes
    /// no further state change.
    pub async fn destroy(&self, team_id: Uuid) -> Result<Team, OrchError> {
        let lock = self.lock_for(team_id).await;
        let _guard = lock.lock().await;

        let team = self.get_team(team_id).await?;
        if team.status == TeamStatus::Destroyed {
            audit::insert(
                &self.pool,
                new_id(),
                "team",
                team_id,
                AuditAction::Update,
                serde_json::to_value(&team).ok(),
                serde_json::to_value(&team).ok(),
                "orchestrator.destroy",
                Some(serde_json::json!({"idempotent": true})),
            )
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;
            return Ok(team);
        }

        let live = orch_db::queries::agents::list_live_agents_for_team(&self.pool, team_id)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;
        let live_ids: Vec<Uuid> = live.into_iter().map(|a| a.id).collect();

        let outcome = self.kill_n(live_ids).await;
        if !outcome.errors.is_empty() {
            tracing::warn!(team_id = %team_id, errors = ?outcome.errors, "some member agents could not be killed during destroy");
        }

        let team = dispatch_destroy(&self.pool, team_id).await?;
        self.events.publish(&topic_for(team_id), serde_json::json!({"event": "destroyed"}));

        Ok(team)
    }

    pub async fn pause(&self, team_id: Uuid) -> Result<Team, OrchError> {
        let lock = self.lock_for(team_id).await;
        let _guard = lock.lock().await;
        dispatch::pause_team(&self.pool, team_id, "orchestrator.pause").await?;
        self.get_team(team_id).await
    }

    pub async fn resume(&self, team_id: Uuid) -> Result<Team, OrchError> {
        let lock = self.lock_for(team_id).await;
        let _guard = lock.lock().await;
        dispatch::resume_team(&self.pool, team_id, "orchestrator.resume").await?;
        self.get_team(team_id).await
    }

    /// Atomically apply a budget consumption delta under the team mutex,
    /// rejecting with `BudgetExceeded` when either ceiling would be
    /// breached, and publishing `team.budget.warning`/`.critical` when the
    /// consumption crosses a threshold.
    pub async fn consume_budget(
        &self,
        team_id: Uuid,
        agent_id: Uuid,
        cost: f64,
        tokens: i64,
    ) -> Result<Team, OrchError> {
        let lock = self.lock_for(team_id).await;
        let _guard = lock.lock().await;

        let mut current = self.get_team(team_id).await?;

        for _ in 0..5 {
            let mut tx = self.pool.begin().await.map_err(|e| OrchError::Internal(e.to_string()))?;

            let rows = teams::consume_budget_tx(&mut tx, team_id, current.version, cost, tokens)
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;

            if rows == 1 {
                let mut next = current.clone();
                next.budget_consumed += cost;
                next.budget_used_tokens += tokens;
                next.version = current.version + 1;

                audit::insert_tx(
                    &mut tx,
                    new_id(),
                    "team",
                    team_id,
                    AuditAction::Update,
                    serde_json::to_value(&current).ok(),
                    serde_json::to_value(&next).ok(),
                    "orchestrator.consume_budget",
                    Some(serde_json::json!({"agent_id": agent_id, "cost": cost, "tokens": tokens})),
                )
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;

                orch_db::queries::versions::set_version(&mut tx, "team", team_id, next.version)
                    .await
                    .map_err(|e| OrchError::Internal(e.to_string()))?;

                tx.commit().await.map_err(|e| OrchError::Internal(e.to_string()))?;

                self.publish_budget_thresholds(&current, &next);
                return Ok(next);
            }

            tx.rollback().await.map_err(|e| OrchError::Internal(e.to_string()))?;

            let refetched = self.get_team(team_id).await?;
            if refetched.version != current.version {
                current = refetched;
                continue;
            }

            let err = OrchError::BudgetExceeded {
                team_id,
                detail: format!(
                    "cost {cost} (consumed {} / allocated {}), tokens {tokens} (used {} / max {:?})",
                    current.budget_consumed, current.budget_allocated, current.budget_used_tokens, current.budget_max_tokens
                ),
            };
            crate::state::record_error_audit(
                &self.pool,
                "team",
                team_id,
                "orchestrator.consume_budget",
                &err,
                serde_json::json!({"agent_id": agent_id, "cost": cost, "tokens": tokens}),
            )
            .await;
            return Err(err);
        }

        let err = OrchError::OptimisticLock {
            entity_type: "team",
            id: team_id,
            expected: current.version,
            actual: current.version,
        };
        crate::state::record_error_audit(
            &self.pool,
            "team",
            team_id,
            "orchestrator.consume_budget",
            &err,
            serde_json::json!({"agent_id": agent_id, "cost": cost, "tokens": tokens}),
        )
        .await;
        Err(err)
    }

    /// Checkpoint every non-terminal team. Called on graceful shutdown so a
    /// restart's recovery pass has a recent snapshot to roll back to.
    pub async fn checkpoint_active_teams(&self) -> Result<usize, OrchError> {
        let active = teams::list_active_teams(&self.pool)
            .await
            .map_err(|e| OrchError::Internal(e.to_string()))?;

        for team in &active {
            let snapshot = serde_json::to_value(team).map_err(|e| OrchError::Internal(e.to_string()))?;
            checkpoints::insert(&self.pool, new_id(), "team", team.id, snapshot, Some("graceful-stop"))
                .await
                .map_err(|e| OrchError::Internal(e.to_string()))?;
        }

        Ok(active.len())
    }

    fn publish_budget_thresholds(&self, before: &Team, after: &Team) {
        if before.budget_allocated <= 0.0 {
            return;
        }
        let before_frac = before.budget_consumed / before.budget_allocated;
        let after_frac = after.budget_consumed / after.budget_allocated;
        if before_frac < BUDGET_CRITICAL_THRESHOLD && after_frac >= BUDGET_CRITICAL_THRESHOLD {
            self.events.publish(
                &topic_for(after.id),
                serde_json::json!({"event": "budget.critical", "consumed": after.budget_consumed, "allocated": after.budget_allocated}),
            );
        } else if before_frac < BUDGET_WARNING_THRESHOLD && after_frac >= BUDGET_WARNING_THRESHOLD {
            self.events.publish(
                &topic_for(after.id),
                serde_json::json!({"event": "budget.warning", "consumed": after.budget_consumed, "allocated": after.budget_allocated}),
            );
        }
    }
}

struct FanoutResult {
    created: Vec<Uuid>,
    errors: Vec<String>,
}

fn default_model_of(team: &Team) -> String {
    team.config
        .get("default_model")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_owned()
}

fn default_task_of(team: &Team) -> String {
    team.config
        .get("default_task")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned()
}

async fn dispatch_destroy(pool: &PgPool, team_id: Uuid) -> Result<Team, OrchError> {
    dispatch::destroy_team(pool, team_id, "orchestrator.destroy").await?;
    teams::get_team(pool, team_id)
        .await
        .map_err(|e| OrchError::Internal(e.to_string()))?
        .ok_or(OrchError::NotFound { entity_type: "team", id: team_id })
}
