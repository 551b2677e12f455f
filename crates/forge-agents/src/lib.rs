//! Per-build agent orchestration core.
//!
//! The pieces, bottom-up: a transition-table FSM with an append-only
//! history ([`fsm`]), a non-blocking subscriber fabric ([`bus`]), pluggable
//! checkpoint persistence ([`checkpoint`]), a sandboxed step executor
//! ([`executor`]), a scoring validator ([`validator`]), pattern + oracle
//! error diagnosis ([`diagnosis`]), the bounded self-healing loop
//! ([`healing`]), and the per-build driver tying them together
//! ([`orchestrator`]). [`bridge`] adapts transition records into wire
//! messages for external push channels.

pub mod bridge;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod diagnosis;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod healing;
pub mod oracle;
pub mod orchestrator;
pub mod state;
pub mod telemetry;
pub mod validator;

pub use bridge::{replay_history, spawn_bridge, PushChannel, PushMessage};
pub use bus::{Subscription, TransitionBus};
pub use checkpoint::{Checkpoint, CheckpointStore, JsonCheckpointStore, MemoryCheckpointStore};
pub use config::ForgeConfig;
pub use diagnosis::{DiagnosisClassifier, DiagnosisResult, DiagnosisSummary, ErrorType, Fix};
pub use error::{AgentError, OracleError};
pub use executor::{BuildPlan, Executor, PlanStep, Workspace};
pub use fsm::{AgentFsm, FsmOptions, FsmSnapshot, StateTransition};
pub use healing::{HealingLoop, HealingOutcome, IterationRecord};
pub use oracle::{AiOracle, HttpOracle, OracleCapability, OracleOptions, RetryingOracle};
pub use orchestrator::{BuildReport, Orchestrator, OrchestratorHandle};
pub use state::{AgentEvent, AgentState};
pub use validator::{FailureSignal, ValidationReport, Validator};
