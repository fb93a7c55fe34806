//! Startup recovery: reconcile persisted state against the assumption that
//! the previous process died mid-flight. Interrupted teams resume where an
//! in-flight operation left them; interrupted agents cannot be trusted to
//! still be alive remotely and are retired instead.

use sqlx::PgPool;

use orch_db::models::AuditAction;
use orch_db::queries::{audit, sessions, teams};

use crate::clock::new_id;
use crate::event_bus::EventBus;

/// Outcome of one [`recover_all`] pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub teams_recovered: usize,
    pub agents_recovered: usize,
    pub sessions_recovered: usize,
    pub errors: Vec<String>,
}

/// Run the full startup recovery pass described by §4.3:
///
/// 1. Teams stuck `creating`/`scaling` are reset to `active`.
/// 2. Agents stuck `spawning`/`running` are retired to `failed`.
/// 3. Open sessions are loaded and republished for reconciliation by
///    whatever owns the live gateway connection.
///
/// Each step is independent; a failure in one does not prevent the others
/// from running. Every reset is also recorded in the audit log with
/// `AuditAction::Recovery`.
pub async fn recover_all(pool: &PgPool, events: &EventBus) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    match teams::reset_interrupted_teams(pool).await {
        Ok(reset) => {
            for team in &reset {
                if let Err(e) = audit::insert(
                    pool,
                    new_id(),
                    "team",
                    team.id,
                    AuditAction::Recovery,
                    None,
                    serde_json::to_value(team).ok(),
                    "recovery.startup",
                    None,
                )
                .await
                {
                    report.errors.push(format!("team {} audit: {e}", team.id));
                }
                events.publish(
                    &format!("team:{}", team.id),
                    serde_json::json!({"event": "recovery.team", "status": team.status.to_string()}),
                );
            }
            report.teams_recovered = reset.len();
        }
        Err(e) => report.errors.push(format!("reset_interrupted_teams: {e}")),
    }

    match orch_db::queries::agents::reset_orphaned_agents(pool).await {
        Ok(reset) => {
            for agent in &reset {
                if let Err(e) = audit::insert(
                    pool,
                    new_id(),
                    "agent",
                    agent.id,
                    AuditAction::Recovery,
                    None,
                    serde_json::to_value(agent).ok(),
                    "recovery.startup",
                    Some(serde_json::json!({"last_error": "interrupted by restart"})),
                )
                .await
                {
                    report.errors.push(format!("agent {} audit: {e}", agent.id));
                }
                events.publish(
                    &format!("agent:{}", agent.id),
                    serde_json::json!({"event": "recovery.agent", "last_error": "interrupted by restart"}),
                );
            }
            report.agents_recovered = reset.len();
        }
        Err(e) => report.errors.push(format!("reset_orphaned_agents: {e}")),
    }

    match sessions::list_open_sessions(pool).await {
        Ok(open) => {
            for session in &open {
                events.publish(
                    &format!("agent:{}", session.agent_id),
                    serde_json::json!({"event": "recovery.session", "session_key": session.session_key}),
                );
            }
            report.sessions_recovered = open.len();
        }
        Err(e) => report.errors.push(format!("list_open_sessions: {e}")),
    }

    tracing::info!(
        teams = report.teams_recovered,
        agents = report.agents_recovered,
        sessions = report.sessions_recovered,
        errors = report.errors.len(),
        "recovery pass complete"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_defaults_to_zero() {
        let report = RecoveryReport::default();
        assert_eq!(report.teams_recovered, 0);
        assert_eq!(report.agents_recovered, 0);
        assert_eq!(report.sessions_recovered, 0);
        assert!(report.errors.is_empty());
    }
}
