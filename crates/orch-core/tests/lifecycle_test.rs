//! Integration tests for `LifecycleManager` against a gateway that is
//! unreachable (non-strict / degraded mode), since no live tool-executor is
//! available in this environment.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use orch_db::models::LifecycleState;
use orch_test_utils::{create_test_db, drop_test_db};

use orch_core::event_bus::EventBus;
use orch_core::lifecycle::{self, LifecycleManager, SpawnOptions};
use orch_core::OrchError;
use orch_gateway::protocol::{AgentEvent, AgentEventStatus};
use orch_gateway::{GatewayClient, GatewayConfig, GatewayEvent};

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

fn spawn_opts() -> SpawnOptions {
    SpawnOptions {
        team_id: None,
        parent_id: None,
        model: "claude-3".to_owned(),
        task: "say hello".to_owned(),
        metadata: serde_json::json!({}),
        max_retries: 3,
    }
}

#[tokio::test]
async fn spawn_in_degraded_mode_still_reaches_running() {
    let (pool, db_name) = create_test_db().await;
    let manager = make_manager(pool.clone()).await;

    let agent = manager.spawn(spawn_opts()).await.expect("spawn should degrade, not fail");
    assert_eq!(agent.lifecycle_state, LifecycleState::Running);
    assert!(agent.session_id.is_none());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn pause_resume_kill_round_trip() {
    let (pool, db_name) = create_test_db().await;
    let manager = make_manager(pool.clone()).await;

    let agent = manager.spawn(spawn_opts()).await.unwrap();

    let paused = manager.pause(agent.id).await.unwrap();
    assert_eq!(paused.lifecycle_state, LifecycleState::Paused);

    let resumed = manager.resume(agent.id).await.unwrap();
    assert_eq!(resumed.lifecycle_state, LifecycleState::Running);

    let killed = manager.kill(agent.id, false).await.unwrap();
    assert_eq!(killed.lifecycle_state, LifecycleState::Killed);
    assert!(killed.session_id.is_none());

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_exhausted_once_max_retries_reached() {
    let (pool, db_name) = create_test_db().await;
    let manager = make_manager(pool.clone()).await;

    let mut opts = spawn_opts();
    opts.max_retries = 1;
    let agent = manager.spawn(opts).await.unwrap();

    orch_db::queries::agents::transition_lifecycle_state(
        &pool,
        agent.id,
        agent.version,
        LifecycleState::Failed,
        orch_db::models::AgentStatus::Failed,
        None,
        None,
        None,
        Some(chrono::Utc::now()),
        Some("boom"),
    )
    .await
    .unwrap();

    manager.retry(agent.id).await.expect("first retry should succeed");

    orch_db::queries::agents::transition_lifecycle_state(
        &pool,
        agent.id,
        manager.get_state(agent.id).await.unwrap().version,
        LifecycleState::Failed,
        orch_db::models::AgentStatus::Failed,
        None,
        None,
        None,
        Some(chrono::Utc::now()),
        Some("boom again"),
    )
    .await
    .unwrap();

    let err = manager.retry(agent.id).await.unwrap_err();
    assert!(matches!(err, OrchError::RetryExhausted { .. }));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn gateway_event_loop_retries_twice_then_goes_terminal() {
    let (pool, db_name) = create_test_db().await;
    let events = EventBus::new();
    let manager = Arc::new(make_manager(pool.clone()).await);

    let mut opts = spawn_opts();
    opts.max_retries = 2;
    let agent = manager.spawn(opts).await.unwrap();
    let sub = events.subscribe(format!("agent:{}", agent.id));

    // Degraded-mode spawns never bind a session; fake one so the event loop
    // can resolve successive `failed` events back to this agent.
    orch_db::queries::agents::bind_session(&pool, agent.id, "fake-session").await.unwrap();

    let (event_tx, event_rx) = mpsc::channel(16);
    let loop_handle = tokio::spawn(lifecycle::run_gateway_event_loop(
        pool.clone(),
        manager.clone(),
        events.clone(),
        event_rx,
    ));

    let send_failed = |tx: mpsc::Sender<GatewayEvent>| async move {
        tx.send(GatewayEvent::Agent(AgentEvent {
            session_key: "fake-session".to_owned(),
            status: AgentEventStatus::Failed,
        }))
        .await
        .unwrap();
    };

    let await_gateway_event = || async {
        tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.expect("event loop did not react in time")
    };

    send_failed(event_tx.clone()).await;
    await_gateway_event().await;
    let after_first = manager.get_state(agent.id).await.unwrap();
    assert_eq!(after_first.retry_count, 1);
    assert_eq!(after_first.lifecycle_state, LifecycleState::Running);

    orch_db::queries::agents::bind_session(&pool, agent.id, "fake-session").await.unwrap();
    send_failed(event_tx.clone()).await;
    await_gateway_event().await;
    let after_second = manager.get_state(agent.id).await.unwrap();
    assert_eq!(after_second.retry_count, 2);
    assert_eq!(after_second.lifecycle_state, LifecycleState::Running);

    orch_db::queries::agents::bind_session(&pool, agent.id, "fake-session").await.unwrap();
    send_failed(event_tx.clone()).await;
    await_gateway_event().await;
    let after_third = manager.get_state(agent.id).await.unwrap();
    assert_eq!(after_third.retry_count, 2);
    assert_eq!(after_third.lifecycle_state, LifecycleState::Failed);
    assert!(after_third.session_id.is_none());

    drop(event_tx);
    loop_handle.abort();
    drop_test_db(&db_name).await;
}
