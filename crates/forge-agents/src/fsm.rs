//! The per-build finite state machine.
//!
//! `AgentFsm` validates transitions against the static table, owns the
//! retry/step counters, and keeps an append-only history. Every accepted
//! transition appends exactly one history record and is offered exactly
//! once to every live subscriber; a failing call leaves all state
//! untouched. Writers take the lock exclusively; read-only snapshots share
//! it.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{Subscription, TransitionBus};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::AgentError;
use crate::state::{transition_target, AgentEvent, AgentState};

/// One accepted transition. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: String,
    pub build_id: String,
    pub from_state: AgentState,
    pub to_state: AgentState,
    pub event: AgentEvent,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub step_id: String,
    /// Milliseconds since the previous transition.
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Read-only view of the FSM at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct FsmSnapshot {
    pub build_id: String,
    pub state: AgentState,
    pub retry_count: u32,
    pub step_index: u32,
    pub total_steps: u32,
    pub max_retries: u32,
    pub progress: f64,
    pub elapsed_ms: u64,
    pub error_message: Option<String>,
    pub checkpoint_count: usize,
    pub transition_count: usize,
}

/// FSM construction options.
#[derive(Debug, Clone)]
pub struct FsmOptions {
    pub max_retries: u32,
    pub total_steps: u32,
}

impl Default for FsmOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            total_steps: 0,
        }
    }
}

struct FsmInner {
    state: AgentState,
    retry_count: u32,
    step_index: u32,
    total_steps: u32,
    max_retries: u32,
    last_transition_at: Instant,
    error_message: Option<String>,
    checkpoints: Vec<Checkpoint>,
    history: Vec<StateTransition>,
}

/// The per-build state machine.
pub struct AgentFsm {
    build_id: String,
    start_time: Instant,
    store: Option<Arc<dyn CheckpointStore>>,
    bus: TransitionBus,
    inner: RwLock<FsmInner>,
}

impl AgentFsm {
    pub fn new(build_id: impl Into<String>, options: FsmOptions) -> Self {
        Self::with_store_opt(build_id, options, None)
    }

    /// FSM with checkpoint persistence. Store failures abort checkpoint
    /// creation.
    pub fn with_store(
        build_id: impl Into<String>,
        options: FsmOptions,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self::with_store_opt(build_id, options, Some(store))
    }

    fn with_store_opt(
        build_id: impl Into<String>,
        options: FsmOptions,
        store: Option<Arc<dyn CheckpointStore>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            build_id: build_id.into(),
            start_time: now,
            store,
            bus: TransitionBus::new(),
            inner: RwLock::new(FsmInner {
                state: AgentState::Idle,
                retry_count: 0,
                step_index: 0,
                total_steps: options.total_steps,
                max_retries: options.max_retries,
                last_transition_at: now,
                error_message: None,
                checkpoints: Vec::new(),
                history: Vec::new(),
            }),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Apply an event. On success the new state is committed, one record is
    /// appended to history, and the record is offered to every subscriber.
    /// On failure nothing changes.
    ///
    /// Counter bookkeeping happens here: `step_complete` advances the step
    /// index; `validation_fail` bumps the retry counter and — once it
    /// passes `max_retries` — is rewritten to `retry_exhausted` targeting
    /// `rolling_back`; `fatal_error` records its metadata as the build's
    /// error message.
    pub fn transition(
        &self,
        event: AgentEvent,
        metadata: Option<serde_json::Value>,
    ) -> Result<StateTransition, AgentError> {
        let mut inner = self.write_inner();

        if inner.state.is_terminal() {
            return Err(AgentError::TerminalState { state: inner.state });
        }
        if event.is_synthetic() {
            // Synthetic events have no table entry; they are emitted
            // internally by checkpoint/rollback paths.
            return Err(AgentError::InvalidTransition {
                state: inner.state,
                event,
            });
        }

        // The table is consulted with the original event; an absent pair
        // fails before any counter moves.
        let mut target =
            transition_target(inner.state, event).ok_or(AgentError::InvalidTransition {
                state: inner.state,
                event,
            })?;

        let mut effective_event = event;
        match event {
            // all_steps_complete reports the final step's completion, so it
            // advances the index too.
            AgentEvent::StepComplete | AgentEvent::AllStepsComplete => inner.step_index += 1,
            AgentEvent::ValidationFail => {
                inner.retry_count += 1;
                if inner.retry_count > inner.max_retries {
                    effective_event = AgentEvent::RetryExhausted;
                    target = AgentState::RollingBack;
                }
            }
            AgentEvent::FatalError => {
                inner.error_message = metadata.as_ref().map(|m| {
                    m.as_str()
                        .map(String::from)
                        .unwrap_or_else(|| m.to_string())
                });
            }
            _ => {}
        }

        let record = self.commit(&mut inner, target, effective_event, None, metadata);
        Ok(record)
    }

    /// Append a record, flip the state, and publish. Caller holds the lock.
    fn commit(
        &self,
        inner: &mut FsmInner,
        target: AgentState,
        event: AgentEvent,
        checkpoint_id: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> StateTransition {
        let record = StateTransition {
            id: Uuid::new_v4().to_string(),
            build_id: self.build_id.clone(),
            from_state: inner.state,
            to_state: target,
            event,
            timestamp: Utc::now(),
            retry_count: inner.retry_count,
            error_message: inner.error_message.clone(),
            checkpoint_id,
            step_id: format!("step-{}", inner.step_index),
            duration_ms: inner.last_transition_at.elapsed().as_millis() as u64,
            metadata,
        };

        debug!(
            build_id = %self.build_id,
            from = %record.from_state,
            to = %record.to_state,
            event = %record.event,
            retry_count = record.retry_count,
            "state transition"
        );

        inner.state = target;
        inner.last_transition_at = Instant::now();
        inner.history.push(record.clone());
        self.bus.publish(&record);
        record
    }

    /// Create a checkpoint of the current progress. Persists first when a
    /// store is configured — a store failure aborts the call and leaves no
    /// in-memory entry. Emits a synthetic `checkpoint_created` record.
    pub async fn create_checkpoint(
        &self,
        description: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Result<String, AgentError> {
        let checkpoint = {
            let inner = self.read_inner();
            if inner.state.is_terminal() {
                return Err(AgentError::TerminalState { state: inner.state });
            }
            Checkpoint {
                id: Uuid::new_v4().to_string(),
                build_id: self.build_id.clone(),
                state: inner.state,
                step_index: inner.step_index,
                created_at: Utc::now(),
                description: description.into(),
                snapshot,
                can_restore: true,
            }
        };

        if let Some(store) = &self.store {
            store
                .save_checkpoint(&checkpoint)
                .await
                .map_err(|e| AgentError::CheckpointPersistence(e.to_string()))?;
        }

        let id = checkpoint.id.clone();
        {
            let mut inner = self.write_inner();
            inner.checkpoints.push(checkpoint);
            let state = inner.state;
            self.commit(
                &mut inner,
                state,
                AgentEvent::CheckpointCreated,
                Some(id.clone()),
                None,
            );
        }

        info!(build_id = %self.build_id, checkpoint_id = %id, "checkpoint created");
        Ok(id)
    }

    /// Restore progress from a checkpoint: state and step index come back,
    /// the retry counter and error message reset. Looks in memory first,
    /// then the store. Emits a synthetic `rollback` record.
    pub async fn rollback_to(&self, checkpoint_id: &str) -> Result<Checkpoint, AgentError> {
        let from_memory = {
            let inner = self.read_inner();
            inner
                .checkpoints
                .iter()
                .find(|cp| cp.id == checkpoint_id)
                .cloned()
        };

        let checkpoint = match from_memory {
            Some(cp) => Some(cp),
            None => match &self.store {
                Some(store) => store
                    .get_checkpoint(&self.build_id, checkpoint_id)
                    .await
                    .map_err(|e| AgentError::CheckpointPersistence(e.to_string()))?,
                None => None,
            },
        };

        let checkpoint = checkpoint.ok_or_else(|| AgentError::CheckpointNotFound {
            id: checkpoint_id.to_string(),
        })?;
        if !checkpoint.can_restore {
            return Err(AgentError::CheckpointNotRestorable {
                id: checkpoint_id.to_string(),
            });
        }

        {
            let mut inner = self.write_inner();
            inner.step_index = checkpoint.step_index;
            inner.retry_count = 0;
            inner.error_message = None;
            self.commit(
                &mut inner,
                checkpoint.state,
                AgentEvent::Rollback,
                Some(checkpoint.id.clone()),
                None,
            );
        }

        info!(
            build_id = %self.build_id,
            checkpoint_id = %checkpoint.id,
            state = %checkpoint.state,
            step_index = checkpoint.step_index,
            "rolled back to checkpoint"
        );
        Ok(checkpoint)
    }

    /// Drop all but the newest `keep_last` checkpoints, from memory and
    /// the store. Returns how many were removed.
    ///
    /// Pruned checkpoints are deleted from the store first; an entry whose
    /// store delete fails stays in memory so it remains restorable.
    pub async fn prune_checkpoints(&self, keep_last: usize) -> Result<usize, AgentError> {
        let excess: Vec<Checkpoint> = {
            let inner = self.read_inner();
            let count = inner.checkpoints.len();
            if count <= keep_last {
                return Ok(0);
            }
            inner.checkpoints[..count - keep_last].to_vec()
        };

        let mut pruned = Vec::with_capacity(excess.len());
        for checkpoint in excess {
            if let Some(store) = &self.store {
                store
                    .delete_checkpoint(&self.build_id, &checkpoint.id)
                    .await
                    .map_err(|e| AgentError::CheckpointPersistence(e.to_string()))?;
            }
            pruned.push(checkpoint.id);
        }

        {
            let mut inner = self.write_inner();
            inner.checkpoints.retain(|cp| !pruned.contains(&cp.id));
        }
        debug!(build_id = %self.build_id, pruned = pruned.len(), "pruned old checkpoints");
        Ok(pruned.len())
    }

    /// The most recent restorable checkpoint, if any.
    pub fn latest_restorable_checkpoint(&self) -> Option<Checkpoint> {
        self.read_inner()
            .checkpoints
            .iter()
            .rev()
            .find(|cp| cp.can_restore)
            .cloned()
    }

    // ── read-only snapshots ──────────────────────────────────────────────

    pub fn current_state(&self) -> AgentState {
        self.read_inner().state
    }

    pub fn retry_count(&self) -> u32 {
        self.read_inner().retry_count
    }

    pub fn step_index(&self) -> u32 {
        self.read_inner().step_index
    }

    pub fn is_terminal(&self) -> bool {
        self.read_inner().state.is_terminal()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Step progress in [0, 1]; 0 when the plan size is unknown.
    pub fn progress(&self) -> f64 {
        let inner = self.read_inner();
        if inner.total_steps == 0 {
            return 0.0;
        }
        (f64::from(inner.step_index) / f64::from(inner.total_steps)).clamp(0.0, 1.0)
    }

    /// Set the plan size once planning produced it.
    pub fn set_total_steps(&self, total_steps: u32) {
        self.write_inner().total_steps = total_steps;
    }

    pub fn error_message(&self) -> Option<String> {
        self.read_inner().error_message.clone()
    }

    /// Owned copy of the transition history.
    pub fn history(&self) -> Vec<StateTransition> {
        self.read_inner().history.clone()
    }

    /// Owned copy of the checkpoint list, creation order.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.read_inner().checkpoints.clone()
    }

    /// One-line human summary of the build's trajectory.
    pub fn summary(&self) -> String {
        let inner = self.read_inner();
        format!(
            "{}: {} ({} transitions, {} retries, {} checkpoints, {}ms)",
            self.build_id,
            inner.state,
            inner.history.len(),
            inner.retry_count,
            inner.checkpoints.len(),
            self.start_time.elapsed().as_millis(),
        )
    }

    pub fn snapshot(&self) -> FsmSnapshot {
        let inner = self.read_inner();
        let progress = if inner.total_steps == 0 {
            0.0
        } else {
            (f64::from(inner.step_index) / f64::from(inner.total_steps)).clamp(0.0, 1.0)
        };
        FsmSnapshot {
            build_id: self.build_id.clone(),
            state: inner.state,
            retry_count: inner.retry_count,
            step_index: inner.step_index,
            total_steps: inner.total_steps,
            max_retries: inner.max_retries,
            progress,
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            error_message: inner.error_message.clone(),
            checkpoint_count: inner.checkpoints.len(),
            transition_count: inner.history.len(),
        }
    }

    // ── subscriber management ────────────────────────────────────────────

    pub fn subscribe(&self, buffer_size: usize) -> Subscription {
        self.bus.subscribe(buffer_size)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    pub fn dropped_record_count(&self) -> u64 {
        self.bus.dropped_count()
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, FsmInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, FsmInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
