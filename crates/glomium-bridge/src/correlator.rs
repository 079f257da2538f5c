//! Call correlator.
//!
//! Every request the bridge sends gets a fresh [`CallId`] and a one-shot
//! slot. The event router settles slots by id; the caller awaits the slot.
//! Each slot is settled at most once and removed when settled, so a late or
//! duplicate settlement for the same id is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use glomium_wire::{CallId, GasSnapshot, ProtocolError, WireValue};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Why a pending call was rejected.
#[derive(Debug)]
pub(crate) enum Rejection {
    /// The sandbox reported an uncaught error.
    Thrown(WireValue),
    /// The engine aborted on gas exhaustion.
    OutOfGas(GasSnapshot),
    /// The engine aborted for another reason.
    EngineFault(GasSnapshot),
    /// The settlement arrived but could not be read.
    Protocol(ProtocolError),
    /// `clear` replaced the context the call was issued against.
    ContextSuperseded,
    /// The bridge went away.
    BridgeClosed,
}

/// What a pending call eventually receives.
pub(crate) type Settlement = Result<WireValue, Rejection>;

struct PendingEntry {
    generation: u64,
    tx: oneshot::Sender<Settlement>,
}

/// Map of in-flight calls keyed by call id.
pub(crate) struct CallCorrelator {
    pending: DashMap<CallId, PendingEntry>,
    epoch: Instant,
    sequence: AtomicU64,
}

impl CallCorrelator {
    pub(crate) fn new() -> Self {
        Self {
            pending: DashMap::new(),
            epoch: Instant::now(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Allocate an id and a slot for a call against `generation`.
    ///
    /// The returned guard removes the slot if it is dropped unsettled.
    pub(crate) fn allocate(&self, generation: u64) -> PendingCall<'_> {
        let (tx, rx) = oneshot::channel();
        let mut entry = Some(PendingEntry { generation, tx });
        loop {
            let id = self.next_id();
            if let Entry::Vacant(slot) = self.pending.entry(id.clone()) {
                if let Some(entry) = entry.take() {
                    slot.insert(entry);
                }
                trace!(call_id = %id, generation, "Allocated pending call");
                return PendingCall {
                    correlator: self,
                    id,
                    rx,
                };
            }
        }
    }

    fn next_id(&self) -> CallId {
        let micros = self.epoch.elapsed().as_micros();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        CallId::new(format!(
            "{micros:x}-{sequence:x}-{:016x}",
            rand::random::<u64>()
        ))
    }

    /// Resolve a pending call. Returns whether a slot was settled.
    pub(crate) fn resolve(&self, id: &CallId, value: WireValue) -> bool {
        self.settle(id, Ok(value))
    }

    /// Reject a pending call. Returns whether a slot was settled.
    pub(crate) fn reject(&self, id: &CallId, rejection: Rejection) -> bool {
        self.settle(id, Err(rejection))
    }

    fn settle(&self, id: &CallId, settlement: Settlement) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            debug!(call_id = %id, "Dropping settlement for unknown call");
            return false;
        };
        trace!(call_id = %id, ok = settlement.is_ok(), "Settled pending call");
        // The caller may have stopped waiting; nothing to do then.
        let _ = entry.tx.send(settlement);
        true
    }

    /// Reject every call issued against a generation older than `generation`.
    /// Returns how many were rejected.
    pub(crate) fn supersede_before(&self, generation: u64) -> usize {
        let stale: Vec<CallId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().generation < generation)
            .map(|entry| entry.key().clone())
            .collect();
        stale
            .iter()
            .filter(|id| self.reject(id, Rejection::ContextSuperseded))
            .count()
    }

    /// Reject everything still pending with [`Rejection::BridgeClosed`].
    pub(crate) fn close(&self) -> usize {
        let ids: Vec<CallId> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.reject(id, Rejection::BridgeClosed))
            .count()
    }

    /// Number of calls awaiting settlement.
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// An allocated slot, owned by the caller awaiting it.
pub(crate) struct PendingCall<'a> {
    correlator: &'a CallCorrelator,
    id: CallId,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingCall<'_> {
    pub(crate) fn id(&self) -> &CallId {
        &self.id
    }

    /// Wait for the settlement.
    pub(crate) async fn settled(mut self) -> Settlement {
        // A dropped sender means the slot was discarded without settling.
        (&mut self.rx).await.unwrap_or(Err(Rejection::BridgeClosed))
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if self.correlator.pending.remove(&self.id).is_some() {
            trace!(call_id = %self.id, "Abandoned pending call");
        }
    }
}
