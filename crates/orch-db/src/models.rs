use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// User-visible status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Blocked,
    Killed,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "killed" => Ok(Self::Killed),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Internal lifecycle state of an agent, richer than [`AgentStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initializing,
    Spawning,
    Running,
    Paused,
    Failed,
    Killed,
    Stopped,
    Completed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for LifecycleState {
    type Err = LifecycleStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "spawning" => Ok(Self::Spawning),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            other => Err(LifecycleStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LifecycleState`] string.
#[derive(Debug, Clone)]
pub struct LifecycleStateParseError(pub String);

impl fmt::Display for LifecycleStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid lifecycle state: {:?}", self.0)
    }
}

impl std::error::Error for LifecycleStateParseError {}

// ---------------------------------------------------------------------------

/// Status of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Creating,
    Active,
    Scaling,
    Paused,
    Destroyed,
    Completed,
    Failed,
}

impl fmt::Display for TeamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Scaling => "scaling",
            Self::Paused => "paused",
            Self::Destroyed => "destroyed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TeamStatus {
    type Err = TeamStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "scaling" => Ok(Self::Scaling),
            "paused" => Ok(Self::Paused),
            "destroyed" => Ok(Self::Destroyed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TeamStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TeamStatus`] string.
#[derive(Debug, Clone)]
pub struct TeamStatusParseError(pub String);

impl fmt::Display for TeamStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid team status: {:?}", self.0)
    }
}

impl std::error::Error for TeamStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of audit action recorded in `state_audit_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Error,
    Recovery,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Error => "error",
            Self::Recovery => "recovery",
        };
        f.write_str(s)
    }
}

impl FromStr for AuditAction {
    type Err = AuditActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "error" => Ok(Self::Error),
            "recovery" => Ok(Self::Recovery),
            other => Err(AuditActionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AuditAction`] string.
#[derive(Debug, Clone)]
pub struct AuditActionParseError(pub String);

impl fmt::Display for AuditActionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid audit action: {:?}", self.0)
    }
}

impl std::error::Error for AuditActionParseError {}

// ---------------------------------------------------------------------------
// Row models
// ---------------------------------------------------------------------------

/// A team -- a named aggregate of agents sharing a budget and scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub status: TeamStatus,
    pub config: serde_json::Value,
    pub budget_allocated: f64,
    pub budget_consumed: f64,
    pub budget_currency: String,
    pub budget_max_tokens: Option<i64>,
    pub budget_used_tokens: i64,
    pub metrics_total: i32,
    pub metrics_completed: i32,
    pub metrics_failed: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Ordered membership of an agent within a team.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TeamAgent {
    pub team_id: Uuid,
    pub agent_id: Uuid,
    pub position: i32,
}

/// An agent -- one unit of work, with its own state machine and typically
/// one remote gateway session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub team_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub status: AgentStatus,
    pub lifecycle_state: LifecycleState,
    pub model: String,
    pub task: String,
    pub metadata: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runtime_ms: i64,
    pub version: i64,
}

/// One entry in an agent's append-only transition history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentStateHistoryEntry {
    pub agent_id: Uuid,
    pub seq: i64,
    pub from_state: Option<LifecycleState>,
    pub to_state: LifecycleState,
    pub ts: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// A remote gateway session bound to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionState {
    pub session_key: String,
    pub agent_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Append-only audit entry, storing full prev/next snapshots rather than
/// deltas so rollback is O(1).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub prev: Option<serde_json::Value>,
    pub next: Option<serde_json::Value>,
    pub triggered_by: String,
    pub metadata: Option<serde_json::Value>,
}

/// An immutable snapshot written before a potentially destructive operation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub snapshot: serde_json::Value,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_display_roundtrip() {
        let variants = [
            AgentStatus::Pending,
            AgentStatus::Running,
            AgentStatus::Paused,
            AgentStatus::Completed,
            AgentStatus::Failed,
            AgentStatus::Blocked,
            AgentStatus::Killed,
        ];
        for v in variants {
            let s = v.to_string();
            assert_eq!(AgentStatus::from_str(&s).unwrap(), v);
        }
        assert!(AgentStatus::from_str("bogus").is_err());
    }

    #[test]
    fn lifecycle_state_display_roundtrip() {
        let variants = [
            LifecycleState::Initializing,
            LifecycleState::Spawning,
            LifecycleState::Running,
            LifecycleState::Paused,
            LifecycleState::Failed,
            LifecycleState::Killed,
            LifecycleState::Stopped,
            LifecycleState::Completed,
        ];
        for v in variants {
            let s = v.to_string();
            assert_eq!(LifecycleState::from_str(&s).unwrap(), v);
        }
        assert!(LifecycleState::from_str("bogus").is_err());
    }

    #[test]
    fn team_status_display_roundtrip() {
        let variants = [
            TeamStatus::Creating,
            TeamStatus::Active,
            TeamStatus::Scaling,
            TeamStatus::Paused,
            TeamStatus::Destroyed,
            TeamStatus::Completed,
            TeamStatus::Failed,
        ];
        for v in variants {
            let s = v.to_string();
            assert_eq!(TeamStatus::from_str(&s).unwrap(), v);
        }
        assert!(TeamStatus::from_str("bogus").is_err());
    }

    #[test]
    fn audit_action_display_roundtrip() {
        let variants = [
            AuditAction::Create,
            AuditAction::Update,
            AuditAction::Delete,
            AuditAction::Error,
            AuditAction::Recovery,
        ];
        for v in variants {
            let s = v.to_string();
            assert_eq!(AuditAction::from_str(&s).unwrap(), v);
        }
        assert!(AuditAction::from_str("bogus").is_err());
    }
}
