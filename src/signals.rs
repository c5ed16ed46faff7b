//! # Wake signals and the per-queue signal table
//!
//! A [`WakeSignal`] is a one-shot completion object: it can be observed
//! (`is_fired`), awaited (`wait`) and explicitly triggered (`fire`). The
//! transport uses them for per-queue "message ready" wakes, for the
//! subscription loop's restart interrupt and for the shared stop signal.
//!
//! The [`SignalRegistry`] maps queue identifiers to their current signal. The
//! correctness-critical property is rotation: replacing a queue's spent signal
//! with a fresh one must never lose a concurrent insert and must never let two
//! callers observe two different "current" signals at once. Both operations
//! go through the map's shard-locked entry API, so get-or-insert is atomic and
//! rotation is a compare-and-swap on `Arc` identity.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One-shot, observable, explicitly-triggerable wake signal
#[derive(Debug, Default)]
pub struct WakeSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl WakeSignal {
    /// Create a fresh, unfired signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal, waking all current and future waiters.
    ///
    /// Firing an already-fired signal is a no-op.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Whether the signal has fired
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut notified = pin!(self.notify.notified());
        loop {
            if self.is_fired() {
                return;
            }
            // Register interest before the final flag check so a fire between
            // check and await cannot be missed.
            notified.as_mut().enable();
            if self.is_fired() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// Concurrent table of per-queue wake signals.
///
/// Invariant: at most one live signal per queue identifier at any instant.
/// Entries are never proactively removed; a stale entry is overwritten on the
/// next rotation (queue counts per host are bounded).
#[derive(Debug, Default)]
pub struct SignalRegistry {
    signals: DashMap<i64, Arc<WakeSignal>>,
}

impl SignalRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic get-or-insert of the signal for `queue_id`.
    ///
    /// Returns the current signal plus whether this call performed the
    /// first-ever insert for the identifier. Idempotent: concurrent callers
    /// for the same identifier all receive the same `Arc`.
    pub fn get_or_create(&self, queue_id: i64) -> (Arc<WakeSignal>, bool) {
        match self.signals.entry(queue_id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let signal = Arc::new(WakeSignal::new());
                entry.insert(signal.clone());
                (signal, true)
            }
        }
    }

    /// Compare-and-swap replacement of the signal for `queue_id`.
    ///
    /// Installs a fresh signal only if the stored entry is still `current`
    /// (by `Arc` identity). If a concurrent rotation already won, the freshly
    /// created replacement is discarded and the winner's signal is returned,
    /// so all callers converge on one "current" signal.
    pub fn rotate(&self, queue_id: i64, current: &Arc<WakeSignal>) -> Arc<WakeSignal> {
        let fresh = Arc::new(WakeSignal::new());
        match self.signals.entry(queue_id) {
            Entry::Occupied(mut entry) => {
                if Arc::ptr_eq(entry.get(), current) {
                    entry.insert(fresh.clone());
                    fresh
                } else {
                    entry.get().clone()
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                fresh
            }
        }
    }

    /// Fire the signal for `queue_id`, if one is registered.
    ///
    /// Returns whether a signal existed for the identifier.
    pub fn fire(&self, queue_id: i64) -> bool {
        match self.signals.get(&queue_id) {
            Some(signal) => {
                signal.fire();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the currently-registered queue identifiers
    pub fn known_queues(&self) -> Vec<i64> {
        self.signals.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered queues
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether no queues are registered
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
