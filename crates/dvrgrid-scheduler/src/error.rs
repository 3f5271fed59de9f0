//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
///
/// Expected no-op conditions (no agent on a host, no SNAT candidates,
/// nothing to unbind, a lost binding race) are outcomes, not errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("router not found: {0}")]
    RouterNotFound(String),

    #[error("failed scheduling router {router_id} to L3 agent {agent_id}: {reason}")]
    SchedulingFailed {
        router_id: String,
        agent_id: String,
        reason: String,
    },

    #[error("state store error: {0}")]
    State(#[from] dvrgrid_state::StateError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl SchedulerError {
    pub fn scheduling_failed(router_id: &str, agent_id: &str, reason: impl ToString) -> Self {
        SchedulerError::SchedulingFailed {
            router_id: router_id.to_string(),
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
