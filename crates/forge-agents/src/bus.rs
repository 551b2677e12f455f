//! Transition fan-out fabric.
//!
//! Each subscriber gets its own bounded FIFO sink. Publishing never blocks
//! the FSM: a full sink drops the record for that sink only (counted), so a
//! stuck consumer cannot stall transitions. Dropped records are recoverable
//! from the FSM's append-only history — consumers that must not miss
//! records reconcile from `history()` on reconnect. Unsubscribing closes
//! the sink exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::fsm::StateTransition;

struct Sink {
    id: u64,
    sender: mpsc::Sender<StateTransition>,
}

/// A live subscription: the handle identifies the sink for unsubscribe,
/// the receiver yields transitions in publish order.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<StateTransition>,
}

/// Non-blocking fan-out of transition records.
pub struct TransitionBus {
    sinks: Mutex<Vec<Sink>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl TransitionBus {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a sink with the given buffer capacity (min 1).
    pub fn subscribe(&self, buffer_size: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_sinks().push(Sink { id, sender });
        debug!(subscriber = id, buffer_size, "transition subscriber added");
        Subscription { id, receiver }
    }

    /// Remove a sink, closing it. Returns whether it existed. A second
    /// call with the same id is a no-op.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut sinks = self.lock_sinks();
        let before = sinks.len();
        sinks.retain(|sink| sink.id != id);
        let removed = sinks.len() < before;
        if removed {
            debug!(subscriber = id, "transition subscriber removed");
        }
        removed
    }

    /// Offer a record to every sink. Full sinks drop this record only;
    /// closed sinks are pruned.
    pub fn publish(&self, record: &StateTransition) {
        let mut sinks = self.lock_sinks();
        sinks.retain(|sink| match sink.sender.try_send(record.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscriber = sink.id,
                    event = %record.event,
                    "slow subscriber: transition record dropped"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sink.id, "pruning closed subscriber");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_sinks().len()
    }

    /// Total records dropped across all sinks since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, Vec<Sink>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TransitionBus {
    fn default() -> Self {
        Self::new()
    }
}
