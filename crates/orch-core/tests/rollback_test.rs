//! Integration tests for create-audit wiring and forward-written rollback.

use std::time::Duration;

use tokio::sync::mpsc;

use orch_db::models::{AuditAction, LifecycleState};
use orch_db::queries::{agents, audit};
use orch_test_utils::{create_test_db, drop_test_db};

use orch_core::event_bus::EventBus;
use orch_core::lifecycle::{LifecycleManager, SpawnOptions};
use orch_core::state::rollback;
use orch_gateway::{GatewayClient, GatewayConfig};

fn degraded_gateway_config() -> GatewayConfig {
    let mut config = GatewayConfig::from_env();
    config.url = "ws://127.0.0.1:1/ws".to_owned();
    config.strict = false;
    config.request_timeout = Duration::from_millis(500);
    config
}

async fn make_manager(pool: sqlx::PgPool) -> LifecycleManager {
    let (events_tx, _events_rx) = mpsc::channel(16);
    let gateway = GatewayClient::connect(degraded_gateway_config(), events_tx)
        .await
        .expect("degraded-mode connect should not fail");
    LifecycleManager::new(pool, gateway, EventBus::new(), false)
}

#[tokio::test]
async fn spawning_an_agent_writes_a_create_audit_entry() {
    let (pool, db_name) = create_test_db().await;
    let manager = make_manager(pool.clone()).await;

    let agent = manager
        .spawn(SpawnOptions {
            team_id: None,
            parent_id: None,
            model: "claude-3".to_owned(),
            task: "say hello".to_owned(),
            metadata: serde_json::json!({}),
            max_retries: 3,
        })
        .await
        .unwrap();

    let entries = audit::list_for_entity(&pool, "agent", agent.id, None, None).await.unwrap();
    let create_entry = entries.iter().find(|e| matches!(e.action, AuditAction::Create));
    let create_entry = create_entry.expect("a create entry should have been recorded");
    assert!(create_entry.prev.is_none());
    assert!(create_entry.next.is_some());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn rollback_restores_agent_to_a_prior_version() {
    let (pool, db_name) = create_test_db().await;
    let manager = make_manager(pool.clone()).await;

    let agent = manager
        .spawn(SpawnOptions {
            team_id: None,
            parent_id: None,
            model: "claude-3".to_owned(),
            task: "say hello".to_owned(),
            metadata: serde_json::json!({}),
            max_retries: 3,
        })
        .await
        .unwrap();
    let running_version = agent.version;
    assert_eq!(agent.lifecycle_state, LifecycleState::Running);

    manager.pause(agent.id).await.unwrap();
    let paused = agents::get_agent(&pool, agent.id).await.unwrap().unwrap();
    assert_eq!(paused.lifecycle_state, LifecycleState::Paused);

    let ok = rollback::rollback(&pool, "agent", agent.id, running_version, "test")
        .await
        .expect("rollback should succeed");
    assert!(ok);

    let agent = agents::get_agent(&pool, agent.id).await.unwrap().unwrap();
    assert_eq!(agent.lifecycle_state, LifecycleState::Running);
    assert!(agent.paused_at.is_none());
    assert_eq!(agent.version, paused.version + 1);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn rollback_to_unreachable_version_returns_false() {
    let (pool, db_name) = create_test_db().await;
    let manager = make_manager(pool.clone()).await;

    let agent = manager
        .spawn(SpawnOptions {
            team_id: None,
            parent_id: None,
            model: "claude-3".to_owned(),
            task: "say hello".to_owned(),
            metadata: serde_json::json!({}),
            max_retries: 3,
        })
        .await
        .unwrap();

    let ok = rollback::rollback(&pool, "agent", agent.id, 999, "test").await.unwrap();
    assert!(!ok);

    drop_test_db(&db_name).await;
}
