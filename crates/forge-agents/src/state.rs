//! Build FSM states, events, and the static transition table.
//!
//! The table is the single source of truth for legal moves: an undefined
//! `(state, event)` pair is an error, never a silent no-op. Terminal states
//! (`Completed`, `Failed`, `Cancelled`) have no outbound edges.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The set of build states.
///
/// Every build starts at `Idle` and terminates at `Completed`, `Failed`,
/// or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Waiting for intake.
    Idle,
    /// Allocating workspace and collaborators.
    Initializing,
    /// Producing the execution plan.
    Planning,
    /// Running plan steps.
    Executing,
    /// Scoring the produced work.
    Validating,
    /// Healing loop engaged after a failed validation.
    Retrying,
    /// Restoring a checkpoint after retries ran out or a fatal error.
    RollingBack,
    /// Externally paused.
    Paused,
    /// Build succeeded — terminal.
    Completed,
    /// Build failed — terminal.
    Failed,
    /// Build cancelled — terminal.
    Cancelled,
}

impl AgentState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Retrying => "retrying",
            Self::RollingBack => "rolling_back",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Events that drive the FSM.
///
/// `CheckpointCreated` and `Rollback` are synthetic: they produce history
/// records and bus publishes but never consult the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Start,
    Initialized,
    PlanReady,
    StepComplete,
    AllStepsComplete,
    ValidationPass,
    ValidationFail,
    RetryExhausted,
    RollbackComplete,
    RollbackFailed,
    Pause,
    Resume,
    Cancel,
    FatalError,
    // Synthetic, record-only.
    CheckpointCreated,
    Rollback,
}

impl AgentEvent {
    /// Whether this event is synthetic (record-only, no table entry).
    pub fn is_synthetic(self) -> bool {
        matches!(self, Self::CheckpointCreated | Self::Rollback)
    }

    /// Stable wire tag for push channels.
    ///
    /// Named events carry a dedicated tag; synthetic events fall back to
    /// `build:fsm:<event>`.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Start => "build:fsm:started",
            Self::Initialized => "build:fsm:initialized",
            Self::PlanReady => "build:fsm:plan_ready",
            Self::StepComplete => "build:fsm:step_complete",
            Self::AllStepsComplete => "build:fsm:all_steps_complete",
            Self::ValidationPass => "build:fsm:validation_passed",
            Self::ValidationFail => "build:fsm:validation_failed",
            Self::RetryExhausted => "build:fsm:retry_exhausted",
            Self::RollbackComplete => "build:fsm:rollback_complete",
            Self::RollbackFailed => "build:fsm:rollback_failed",
            Self::Pause => "build:fsm:paused",
            Self::Resume => "build:fsm:resumed",
            Self::Cancel => "build:fsm:cancelled",
            Self::FatalError => "build:fsm:fatal_error",
            Self::CheckpointCreated => "build:fsm:checkpoint_created",
            Self::Rollback => "build:fsm:rollback",
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Initialized => "initialized",
            Self::PlanReady => "plan_ready",
            Self::StepComplete => "step_complete",
            Self::AllStepsComplete => "all_steps_complete",
            Self::ValidationPass => "validation_pass",
            Self::ValidationFail => "validation_fail",
            Self::RetryExhausted => "retry_exhausted",
            Self::RollbackComplete => "rollback_complete",
            Self::RollbackFailed => "rollback_failed",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::FatalError => "fatal_error",
            Self::CheckpointCreated => "checkpoint_created",
            Self::Rollback => "rollback",
        };
        write!(f, "{name}")
    }
}

/// Look up the target state for `(state, event)`.
///
/// The state graph:
/// ```text
/// Idle          → start → Initializing
/// Initializing  → initialized → Planning
/// Planning      → plan_ready → Executing
/// Executing     → step_complete → Executing
///               → all_steps_complete → Validating
/// Validating    → validation_pass → Completed
///               → validation_fail → Retrying
/// Retrying      → validation_pass → Completed
///               → validation_fail → Retrying
///               → retry_exhausted → RollingBack
/// RollingBack   → rollback_complete → Executing
///               → rollback_failed → Failed
/// Paused        → resume → Executing
/// ```
/// plus: `pause` from Executing/Validating/Retrying, `cancel` from every
/// non-terminal state, and `fatal_error` routing every non-terminal state
/// except RollingBack to RollingBack (a fatal during rollback fails the
/// build outright).
pub fn transition_target(state: AgentState, event: AgentEvent) -> Option<AgentState> {
    use self::AgentEvent as E;
    use self::AgentState as S;

    if state.is_terminal() {
        return None;
    }

    // Uniform edges first.
    match event {
        E::Cancel => return Some(S::Cancelled),
        E::FatalError => {
            return Some(if state == S::RollingBack {
                S::Failed
            } else {
                S::RollingBack
            })
        }
        _ => {}
    }

    let target = match (state, event) {
        (S::Idle, E::Start) => S::Initializing,
        (S::Initializing, E::Initialized) => S::Planning,
        (S::Planning, E::PlanReady) => S::Executing,
        (S::Executing, E::StepComplete) => S::Executing,
        (S::Executing, E::AllStepsComplete) => S::Validating,
        (S::Validating, E::ValidationPass) => S::Completed,
        (S::Validating, E::ValidationFail) => S::Retrying,
        (S::Retrying, E::ValidationPass) => S::Completed,
        (S::Retrying, E::ValidationFail) => S::Retrying,
        (S::Retrying, E::RetryExhausted) => S::RollingBack,
        (S::RollingBack, E::RollbackComplete) => S::Executing,
        (S::RollingBack, E::RollbackFailed) => S::Failed,
        (S::Executing | S::Validating | S::Retrying, E::Pause) => S::Paused,
        (S::Paused, E::Resume) => S::Executing,
        _ => return None,
    };
    Some(target)
}
