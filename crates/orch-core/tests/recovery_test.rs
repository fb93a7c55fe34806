//! Integration test for the startup recovery pass (§8 scenario: recovery
//! after crash).

use orch_db::models::{AgentStatus, LifecycleState, TeamStatus};
use orch_db::queries::{agents, teams};
use orch_test_utils::{create_test_db, drop_test_db};

use orch_core::event_bus::EventBus;
use orch_core::recovery::recover_all;

#[tokio::test]
async fn recover_all_retires_orphaned_agents_and_resumes_interrupted_teams() {
    let (pool, db_name) = create_test_db().await;

    let team = teams::insert_team(
        &pool,
        uuid::Uuid::new_v4(),
        "crashed-team",
        serde_json::json!({"max_agents": 5}),
        100.0,
        "usd",
        None,
    )
    .await
    .unwrap();
    teams::transition_team_status(&pool, team.id, team.version, TeamStatus::Scaling, None)
        .await
        .unwrap();

    let agent = agents::insert_agent(
        &pool,
        uuid::Uuid::new_v4(),
        Some(team.id),
        None,
        "claude-3",
        "say hello",
        serde_json::json!({}),
        3,
    )
    .await
    .unwrap();
    agents::transition_lifecycle_state(
        &pool,
        agent.id,
        agent.version,
        LifecycleState::Running,
        AgentStatus::Running,
        Some(chrono::Utc::now()),
        None,
        None,
        None,
        None,
    )
    .await
    .unwrap();

    let events = EventBus::new();
    let team_sub = events.subscribe(format!("team:{}", team.id));
    let agent_sub = events.subscribe(format!("agent:{}", agent.id));

    let report = recover_all(&pool, &events).await;

    assert_eq!(report.teams_recovered, 1);
    assert_eq!(report.agents_recovered, 1);
    assert!(report.errors.is_empty());

    let team = teams::get_team(&pool, team.id).await.unwrap().unwrap();
    assert_eq!(team.status, TeamStatus::Active);

    let agent = agents::get_agent(&pool, agent.id).await.unwrap().unwrap();
    assert_eq!(agent.lifecycle_state, LifecycleState::Failed);
    assert_eq!(agent.last_error.as_deref(), Some("interrupted by restart"));
    assert!(agent.completed_at.is_some());

    let team_event = tokio::time::timeout(std::time::Duration::from_secs(1), team_sub.recv())
        .await
        .expect("team recovery event published");
    assert_eq!(team_event["event"], "recovery.team");
    let agent_event = tokio::time::timeout(std::time::Duration::from_secs(1), agent_sub.recv())
        .await
        .expect("agent recovery event published");
    assert_eq!(agent_event["event"], "recovery.agent");

    let audit = orch_db::queries::audit::list_for_entity(&pool, "agent", agent.id, None, None)
        .await
        .unwrap();
    assert!(audit.iter().any(|e| matches!(e.action, orch_db::models::AuditAction::Recovery)));

    drop_test_db(&db_name).await;
}
