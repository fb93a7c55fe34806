//! Integration tests for `TeamOrchestrator`: create/scale/destroy and
//! budget accounting, against a gateway that degrades immediately (no live
//! tool-executor in this environment).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use orch_db::models::TeamStatus;
use orch_test_utils::{create_test_db, drop_test_db};

use orch_core::event_bus::EventBus;
use orch_core::lifecycle::LifecycleManager;
use orch_core::orchestrator::{TeamCreateConfig, TeamOrchestrator};
use orch_core::OrchError;
use orch_gateway::{GatewayClient, GatewayConfig};

fn degraded_gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::from_env();
    config.url = "ws://127.0.0.1:1/ws".to_owned();
    config.strict = false;
    config.request_timeout = Duration::from_millis(500);
    config
}

async fn make_orchestrator(pool: sqlx::PgPool, events: EventBus) -> TeamOrchestrator {
    let (events_tx, _events_rx) = mpsc::channel(16);
    let gateway = GatewayClient::connect(degraded_gateway_config(), events_tx)
        .await
        .expect("degraded-mode connect should not fail");
    let lifecycle = Arc::new(LifecycleManager::new(pool.clone(), gateway, events.clone(), false));
    TeamOrchestrator::new(pool, lifecycle, events)
}

async fn make_strict_orchestrator(pool: sqlx::PgPool, events: EventBus) -> TeamOrchestrator {
    let (events_tx, _events_rx) = mpsc::channel(16);
    let gateway = GatewayClient::connect(degraded_gateway_config(), events_tx)
        .await
        .expect("degraded-mode connect should not fail");
    let lifecycle = Arc::new(LifecycleManager::new(pool.clone(), gateway, events.clone(), true));
    TeamOrchestrator::new(pool, lifecycle, events)
}

fn team_config(initial_agents: usize, max_agents: usize) -> TeamCreateConfig {
    TeamCreateConfig {
        name: "test-team".to_owned(),
        config: serde_json::json!({}),
        budget_allocated: 100.0,
        budget_currency: "usd".to_owned(),
        budget_max_tokens: Some(1_000_000),
        initial_agents,
        max_agents,
        default_model: "claude-3".to_owned(),
        default_task: "say hello".to_owned(),
        agent_max_retries: 3,
    }
}

#[tokio::test]
async fn create_spawns_initial_agents_and_activates() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_orchestrator(pool.clone(), EventBus::new()).await;

    let team = orchestrator.create(team_config(2, 5)).await.expect("create should succeed");
    assert_eq!(team.status, TeamStatus::Active);
    assert_eq!(team.metrics_total, 2);

    let members = orch_db::queries::teams::list_team_agent_ids(&pool, team.id).await.unwrap();
    assert_eq!(members.len(), 2);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn scale_up_then_down_adjusts_live_agent_count() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_orchestrator(pool.clone(), EventBus::new()).await;

    let team = orchestrator.create(team_config(1, 5)).await.unwrap();

    let scaled_up = orchestrator.scale(team.id, 3).await.expect("scale up");
    assert_eq!(scaled_up.created.len(), 2);

    let live = orch_db::queries::agents::list_live_agents_for_team(&pool, team.id).await.unwrap();
    assert_eq!(live.len(), 3);

    let scaled_down = orchestrator.scale(team.id, 1).await.expect("scale down");
    assert_eq!(scaled_down.killed.len(), 2);

    let live = orch_db::queries::agents::list_live_agents_for_team(&pool, team.id).await.unwrap();
    assert_eq!(live.len(), 1);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn scale_past_max_agents_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_orchestrator(pool.clone(), EventBus::new()).await;

    let team = orchestrator.create(team_config(1, 3)).await.unwrap();

    let err = orchestrator.scale(team.id, 4).await.unwrap_err();
    assert!(matches!(err, OrchError::StateConflict { .. }));

    let team = orchestrator.get_team(team.id).await.unwrap();
    assert_eq!(team.status, TeamStatus::Active);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn destroy_kills_members_and_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_orchestrator(pool.clone(), EventBus::new()).await;

    let team = orchestrator.create(team_config(2, 5)).await.unwrap();

    let destroyed = orchestrator.destroy(team.id).await.expect("destroy");
    assert_eq!(destroyed.status, TeamStatus::Destroyed);

    let live = orch_db::queries::agents::list_live_agents_for_team(&pool, team.id).await.unwrap();
    assert!(live.is_empty());

    // Second call is idempotent: no state change, but an audit entry is
    // still recorded.
    let destroyed_again = orchestrator.destroy(team.id).await.expect("idempotent destroy");
    assert_eq!(destroyed_again.status, TeamStatus::Destroyed);
    assert_eq!(destroyed_again.version, destroyed.version);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn checkpoint_active_teams_skips_destroyed_teams() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_orchestrator(pool.clone(), EventBus::new()).await;

    let live = orchestrator.create(team_config(1, 3)).await.unwrap();
    let destroyed = orchestrator.create(team_config(1, 3)).await.unwrap();
    orchestrator.destroy(destroyed.id).await.unwrap();

    let checkpointed = orchestrator.checkpoint_active_teams().await.expect("checkpoint sweep");
    assert_eq!(checkpointed, 1);

    let live_checkpoints = orch_db::queries::checkpoints::list_for_entity(&pool, "team", live.id).await.unwrap();
    assert_eq!(live_checkpoints.len(), 1);

    let destroyed_checkpoints =
        orch_db::queries::checkpoints::list_for_entity(&pool, "team", destroyed.id).await.unwrap();
    assert!(destroyed_checkpoints.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn scale_up_with_strict_gateway_down_surfaces_partial_scale() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_strict_orchestrator(pool.clone(), EventBus::new()).await;

    // initial_agents=0: `create` itself spawns nothing, so it succeeds even
    // though the gateway is unreachable and strict is on.
    let team = orchestrator.create(team_config(0, 3)).await.unwrap();

    let err = orchestrator.scale(team.id, 2).await.unwrap_err();
    match err {
        OrchError::PartialScale { created, errors } => {
            assert!(created.is_empty());
            assert_eq!(errors.len(), 2);
        }
        other => panic!("expected PartialScale, got {other:?}"),
    }

    let live = orch_db::queries::agents::list_live_agents_for_team(&pool, team.id).await.unwrap();
    assert!(live.is_empty());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn consume_budget_rejects_once_allocation_exhausted() {
    let (pool, db_name) = create_test_db().await;
    let orchestrator = make_orchestrator(pool.clone(), EventBus::new()).await;

    let mut config = team_config(0, 5);
    config.budget_allocated = 10.0;
    let team = orchestrator.create(config).await.unwrap();
    let agent_id = uuid::Uuid::new_v4();

    let after = orchestrator.consume_budget(team.id, agent_id, 6.0, 100).await.expect("within budget");
    assert_eq!(after.budget_consumed, 6.0);

    let err = orchestrator.consume_budget(team.id, agent_id, 6.0, 100).await.unwrap_err();
    assert!(matches!(err, OrchError::BudgetExceeded { .. }));

    let entries = orch_db::queries::audit::list_for_entity(&pool, "team", team.id, None, None).await.unwrap();
    let error_entry = entries
        .iter()
        .find(|e| matches!(e.action, orch_db::models::AuditAction::Error))
        .expect("a budget-exceeded error audit entry should have been recorded");
    assert_eq!(
        error_entry.metadata.as_ref().and_then(|m| m.get("agent_id")).and_then(|v| v.as_str()),
        Some(agent_id.to_string()).as_deref()
    );

    drop_test_db(&db_name).await;
}
