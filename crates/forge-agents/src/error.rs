//! Build-core error taxonomy.
//!
//! Every component surfaces one of these kinds; the orchestrator decides
//! what escalates. The FSM itself never retries — recovery belongs to the
//! healing loop, and anything unrecovered becomes a `fatal_error` routing
//! to rollback.

use thiserror::Error;

use crate::state::{AgentEvent, AgentState};

/// Errors raised by the oracle capability.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The tenant is out of credits. The only oracle failure surfaced to
    /// the end user verbatim.
    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("oracle request failed: {0}")]
    Request(String),

    #[error("oracle response unparseable: {0}")]
    Response(String),

    #[error("oracle call timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Unified error type for the agent core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The transition table has no entry for this pair. Non-fatal; the
    /// FSM state is unchanged.
    #[error("invalid transition: {state} + {event}")]
    InvalidTransition { state: AgentState, event: AgentEvent },

    /// A mutation was attempted after the FSM reached a terminal state.
    #[error("build is terminal in state {state}")]
    TerminalState { state: AgentState },

    /// The checkpoint store rejected a write. Creation is aborted — no
    /// in-memory checkpoint is left behind.
    #[error("checkpoint persistence failed: {0}")]
    CheckpointPersistence(String),

    /// The checkpoint exists but is flagged non-restorable.
    #[error("checkpoint {id} is not restorable")]
    CheckpointNotRestorable { id: String },

    /// The checkpoint could not be found in memory or in the store.
    #[error("checkpoint {id} not found")]
    CheckpointNotFound { id: String },

    /// A child process exited non-zero. May feed the healing loop.
    #[error("command exited with code {code}: {stderr}")]
    CommandExit { code: i32, stderr: String },

    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    /// A deadline elapsed. The orchestrator translates this into
    /// `fatal_error`.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The build was cancelled mid-operation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether the healing loop may attempt recovery. Everything else goes
    /// straight to `fatal_error`.
    pub fn is_healable(&self) -> bool {
        matches!(self, Self::CommandExit { .. })
    }

    /// Whether this kind is surfaced to the end user verbatim. Only credit
    /// exhaustion qualifies; other oracle failures are internal.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Oracle(OracleError::InsufficientCredits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = AgentError::InvalidTransition {
            state: AgentState::Paused,
            event: AgentEvent::ValidationFail,
        };
        assert_eq!(err.to_string(), "invalid transition: paused + validation_fail");
    }

    #[test]
    fn test_command_exit_is_healable() {
        let err = AgentError::CommandExit {
            code: 1,
            stderr: "error TS2304".into(),
        };
        assert!(err.is_healable());
        assert!(!err.is_user_visible());
    }

    #[test]
    fn test_only_insufficient_credits_is_user_visible() {
        assert!(AgentError::Oracle(OracleError::InsufficientCredits).is_user_visible());
        assert!(!AgentError::Oracle(OracleError::Request("503".into())).is_user_visible());
        assert!(!AgentError::Timeout {
            operation: "bundle".into(),
            seconds: 30
        }
        .is_user_visible());
    }
}
