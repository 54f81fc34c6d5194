//! # Timer Registry
//!
//! Owns the per-agreement background timers:
//!
//! | Kind         | Behaviour                                              |
//! |--------------|--------------------------------------------------------|
//! | `Heartbeat`  | Fires every interval until cancelled. First fire after one interval. |
//! | `Expiration` | Fires once after a delay, then unregisters itself.     |
//!
//! Timers are keyed by agreement index. Registering a kind that already exists
//! for the agreement replaces (aborts) the old timer. Timers run independently
//! of the chain subscription and survive its restarts.
//!
//! ## Self-removal
//!
//! An expiration timer removes its own entry *before* running its callback,
//! so a callback that calls [`TimerRegistry::cancel`] for its own agreement
//! only aborts the heartbeat, never itself. Removal is generation-checked: a
//! stale timer never removes a newer registration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Heartbeat,
    Expiration,
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct AgreementTimers {
    heartbeat: Option<TimerEntry>,
    expiration: Option<TimerEntry>,
}

impl AgreementTimers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerEntry> {
        match kind {
            TimerKind::Heartbeat => &mut self.heartbeat,
            TimerKind::Expiration => &mut self.expiration,
        }
    }

    fn is_empty(&self) -> bool {
        self.heartbeat.is_none() && self.expiration.is_none()
    }
}

type TimerMap = HashMap<u64, AgreementTimers>;

/// Cloneable handle to the shared timer table.
#[derive(Clone, Default)]
pub struct TimerRegistry {
    timers: Arc<Mutex<TimerMap>>,
    generation: Arc<AtomicU64>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a recurring timer calling `tick(agreement_index)` every `period`.
    pub fn register_heartbeat<F, Fut>(&self, agreement_index: u64, period: Duration, mut tick: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick(agreement_index).await;
            }
        });
        Self::install(&mut timers, agreement_index, TimerKind::Heartbeat, generation, handle);
        debug!(agreement_index, ?period, "heartbeat timer registered");
    }

    /// Start a one-shot timer calling `fire(agreement_index)` after `delay`.
    /// A zero delay fires on the next scheduler turn.
    pub fn register_expiration<F, Fut>(&self, agreement_index: u64, delay: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut timers = self.timers.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let table = Arc::clone(&self.timers);
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            Self::remove_own(&table, agreement_index, generation);
            fire(agreement_index).await;
        });
        Self::install(&mut timers, agreement_index, TimerKind::Expiration, generation, handle);
        debug!(agreement_index, ?delay, "expiration timer registered");
    }

    fn install(
        timers: &mut TimerMap,
        agreement_index: u64,
        kind: TimerKind,
        generation: u64,
        handle: JoinHandle<()>,
    ) {
        let slot = timers.entry(agreement_index).or_default().slot(kind);
        if let Some(old) = slot.replace(TimerEntry { generation, handle }) {
            old.handle.abort();
        }
    }

    fn remove_own(table: &Mutex<TimerMap>, agreement_index: u64, generation: u64) {
        let mut timers = table.lock();
        if let Some(entry) = timers.get_mut(&agreement_index) {
            let ours = entry
                .expiration
                .as_ref()
                .map(|e| e.generation == generation)
                .unwrap_or(false);
            if ours {
                entry.expiration = None;
            }
            if entry.is_empty() {
                timers.remove(&agreement_index);
            }
        }
    }

    /// Cancel every timer of the agreement. Returns whether any existed.
    pub fn cancel(&self, agreement_index: u64) -> bool {
        let removed = self.timers.lock().remove(&agreement_index);
        match removed {
            Some(entry) => {
                for e in [entry.heartbeat, entry.expiration].into_iter().flatten() {
                    e.handle.abort();
                }
                debug!(agreement_index, "timers cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel one timer kind of the agreement. Returns whether it existed.
    pub fn cancel_kind(&self, agreement_index: u64, kind: TimerKind) -> bool {
        let mut timers = self.timers.lock();
        let Some(entry) = timers.get_mut(&agreement_index) else {
            return false;
        };
        let cancelled = match entry.slot(kind).take() {
            Some(e) => {
                e.handle.abort();
                true
            }
            None => false,
        };
        if entry.is_empty() {
            timers.remove(&agreement_index);
        }
        cancelled
    }

    pub fn is_registered(&self, agreement_index: u64, kind: TimerKind) -> bool {
        self.timers
            .lock()
            .get_mut(&agreement_index)
            .map(|e| e.slot(kind).is_some())
            .unwrap_or(false)
    }

    /// Agreements with at least one live timer.
    pub fn agreements(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.timers.lock().keys().copied().collect();
        out.sort_unstable();
        out
    }

    /// Cancel everything.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.timers.lock().drain().collect();
        for (_, entry) in drained {
            for e in [entry.heartbeat, entry.expiration].into_iter().flatten() {
                e.handle.abort();
            }
        }
    }
}
