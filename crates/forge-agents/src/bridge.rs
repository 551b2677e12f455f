//! Bridge from the transition bus to external push channels.
//!
//! Wraps each transition record in a wire message: the event's stable tag
//! plus a snapshot of `progress`, `fsm_state`, and `elapsed_ms` taken at
//! emission time. The pump runs until the subscription closes, the build
//! is cancelled, or the push channel reports a hard failure.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fsm::{AgentFsm, StateTransition};
use crate::state::AgentState;

/// One wire message for external push delivery.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    /// Stable event tag, e.g. `build:fsm:started`.
    pub tag: String,
    pub transition: StateTransition,
    /// Build progress at emission time.
    pub progress: f64,
    /// FSM state at emission time.
    pub fsm_state: AgentState,
    /// Build wall-clock at emission time.
    pub elapsed_ms: u64,
}

impl PushMessage {
    /// Envelope shape pushed over the wire: `{event, data}`.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "event": self.tag,
            "data": {
                "transition": self.transition,
                "progress": self.progress,
                "fsm_state": self.fsm_state,
                "elapsed_ms": self.elapsed_ms,
            }
        })
    }
}

/// External push capability (websocket hub, SSE fan-out, queue).
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn push(&self, message: PushMessage) -> anyhow::Result<()>;
}

/// Build the wire message for one transition against the current FSM view.
pub fn wire_message(fsm: &AgentFsm, transition: StateTransition) -> PushMessage {
    PushMessage {
        tag: transition.event.tag().to_string(),
        progress: fsm.progress(),
        fsm_state: fsm.current_state(),
        elapsed_ms: fsm.elapsed_ms(),
        transition,
    }
}

/// Replay the full transition history into a push channel.
///
/// Reconnect path for consumers whose bounded sink dropped records: they
/// resubscribe, then replay to reconcile. Every replayed message carries
/// the CURRENT progress/state snapshot, not the historical one — the
/// receiver orders by the transition's own timestamp.
pub async fn replay_history(
    fsm: &AgentFsm,
    channel: &dyn PushChannel,
) -> anyhow::Result<usize> {
    let history = fsm.history();
    let count = history.len();
    for record in history {
        channel.push(wire_message(fsm, record)).await?;
    }
    debug!(count, "replayed transition history");
    Ok(count)
}

/// Spawn the bridge pump: FSM subscription → push channel.
///
/// The subscription uses a bounded sink, so a slow push channel misses
/// records rather than stalling the FSM; missed records are recoverable
/// from `AgentFsm::history`.
pub fn spawn_bridge(
    fsm: Arc<AgentFsm>,
    channel: Arc<dyn PushChannel>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut subscription = fsm.subscribe(buffer_size);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                record = subscription.receiver.recv() => {
                    let Some(record) = record else {
                        debug!("bridge subscription closed");
                        break;
                    };
                    let message = wire_message(&fsm, record);
                    if let Err(e) = channel.push(message).await {
                        warn!(error = %e, "push channel rejected message; stopping bridge");
                        break;
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("bridge cancelled");
                    break;
                }
            }
        }
        fsm.unsubscribe(subscription.id);
    })
}
