//! Error taxonomy for the orchestration core.
//!
//! One dedicated variant per kind so callers can match without downcasting,
//! the same shape `orch_db::models`'s per-enum parse errors use.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchError {
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: &'static str, id: Uuid },

    #[error("illegal transition for {entity_type} {id}: {from} -> {to}")]
    StateConflict {
        entity_type: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("optimistic lock failed on {entity_type} {id}: expected version {expected}, found {actual}")]
    OptimisticLock {
        entity_type: &'static str,
        id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("team {team_id} budget exceeded: {detail}")]
    BudgetExceeded { team_id: Uuid, detail: String },

    #[error("agent {agent_id} cannot retry: {retry_count} >= max_retries {max_retries}")]
    RetryExhausted {
        agent_id: Uuid,
        retry_count: i32,
        max_retries: i32,
    },

    #[error("operation on {entity_type} {id} timed out after {elapsed:?}")]
    Timeout {
        entity_type: &'static str,
        id: Uuid,
        elapsed: Duration,
    },

    #[error("gateway connection error: {0}")]
    ConnectionError(String),

    #[error("gateway authentication error: {0}")]
    AuthenticationError(String),

    #[error("partial scale: {} agents created, {} errors", .created.len(), .errors.len())]
    PartialScale {
        created: Vec<Uuid>,
        errors: Vec<String>,
    },

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl OrchError {
    /// Stable short name for the error kind, used in audit-log metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::StateConflict { .. } => "state_conflict",
            Self::OptimisticLock { .. } => "optimistic_lock",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionError(_) => "connection_error",
            Self::AuthenticationError(_) => "authentication_error",
            Self::PartialScale { .. } => "partial_scale",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<orch_gateway::GatewayError> for OrchError {
    fn from(e: orch_gateway::GatewayError) -> Self {
        match e {
            orch_gateway::GatewayError::Authentication(msg) => Self::AuthenticationError(msg),
            orch_gateway::GatewayError::Timeout(d) => Self::Timeout {
                entity_type: "gateway_request",
                id: Uuid::nil(),
                elapsed: d,
            },
            other => Self::ConnectionError(other.to_string()),
        }
    }
}
