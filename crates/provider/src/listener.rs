//! # Chain Listener
//!
//! Keeps a live subscription to the chain's `System.Events` storage key and
//! feeds every change set through the decoder into the [`OrderDispatcher`].
//!
//! ## Supervision
//!
//! ```text
//! start() ── register resource ──► supervisor task
//!                                     │
//!                                     ├─ spawn worker ──► fetch metadata
//!                                     │                   subscribe System.Events
//!                                     │                   loop: change set → decode → dispatch
//!                                     │
//!                                     ├─ worker Err / panic ──► log, wait restart_delay, respawn
//!                                     └─ stop signal ─────────► wait for worker, exit
//! ```
//!
//! The worker observes the stop signal between change sets, so a change set
//! being dispatched is finished before the worker exits. A worker that does
//! not finish within [`STOP_GRACE`] is aborted.
//!
//! Only one worker runs at a time. Restarting a worker never re-registers
//! the resource. The stop signal is a `watch` channel, so sending it never
//! blocks and a late receiver still observes it.
//!
//! ## States
//!
//! `Stopped → Starting → Running → (Starting on failure) → Stopping → Stopped`
//!
//! Registration happens in `Starting`; its failure aborts `start()` and the
//! listener returns to `Stopped`. Stop deregisters the resource.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainError, StorageChangeSet, StorageKey};
use crate::dispatcher::OrderDispatcher;
use crate::events::EventDecoder;
use crate::registration::{RegistrationController, RegistrationError};

/// How long stop waits for an in-flight change set before aborting the worker.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

// ════════════════════════════════════════════════════════════════════════════════
// ERRORS AND STATE
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("subscription closed by the chain")]
    SubscriptionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

// ════════════════════════════════════════════════════════════════════════════════
// LISTENER
// ════════════════════════════════════════════════════════════════════════════════

/// Shared between the listener handle, its supervisor and the worker.
#[derive(Clone)]
struct WorkerContext {
    chain: Arc<dyn ChainClient>,
    dispatcher: Arc<OrderDispatcher>,
    state: Arc<RwLock<ListenerState>>,
    worker_starts: Arc<AtomicU64>,
    restart_delay: Duration,
}

struct Supervisor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    async fn shutdown(self) {
        // the receiver may already be gone if the supervisor exited
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("listener supervisor panicked");
            }
        }
    }
}

pub struct ChainListener {
    ctx: WorkerContext,
    registration: Arc<RegistrationController>,
    enabled: AtomicBool,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

impl ChainListener {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        dispatcher: Arc<OrderDispatcher>,
        registration: Arc<RegistrationController>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            ctx: WorkerContext {
                chain,
                dispatcher,
                state: Arc::new(RwLock::new(ListenerState::Stopped)),
                worker_starts: Arc::new(AtomicU64::new(0)),
                restart_delay,
            },
            registration,
            enabled: AtomicBool::new(false),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.ctx.state.read()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Workers launched so far: the first start plus every restart.
    pub fn worker_starts(&self) -> u64 {
        self.ctx.worker_starts.load(Ordering::SeqCst)
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ListenerError> {
        if enabled {
            self.start().await
        } else {
            self.stop().await;
            Ok(())
        }
    }

    /// Register the resource and launch the supervised worker. A listener
    /// that is already running is restarted.
    pub async fn start(&self) -> Result<(), ListenerError> {
        let mut slot = self.supervisor.lock().await;
        if let Some(previous) = slot.take() {
            debug!("restarting listener");
            previous.shutdown().await;
        }

        self.set_state(ListenerState::Starting);
        if let Err(e) = self.registration.register().await {
            error!("register resource error: {}", e);
            self.set_state(ListenerState::Stopped);
            self.enabled.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(self.ctx.clone(), stop_rx));
        *slot = Some(Supervisor { stop, handle });
        self.enabled.store(true, Ordering::SeqCst);
        info!("chain listener started");
        Ok(())
    }

    /// Stop the worker once its current change set is dispatched, then
    /// deregister the resource. No-op when stopped.
    pub async fn stop(&self) {
        let mut slot = self.supervisor.lock().await;
        let Some(supervisor) = slot.take() else {
            debug!("listener already stopped");
            return;
        };

        self.set_state(ListenerState::Stopping);
        supervisor.shutdown().await;
        self.registration.deregister().await;
        self.set_state(ListenerState::Stopped);
        self.enabled.store(false, Ordering::SeqCst);
        info!("chain listener stopped");
    }

    fn set_state(&self, state: ListenerState) {
        *self.ctx.state.write() = state;
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// SUPERVISOR AND WORKER
// ════════════════════════════════════════════════════════════════════════════════

async fn supervise(ctx: WorkerContext, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        let starts = ctx.worker_starts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(starts, "launching listener worker");
        let mut worker = tokio::spawn(run_worker(ctx.clone(), stop.clone()));

        let exit = tokio::select! {
            result = &mut worker => Some(result),
            _ = stop.changed() => None,
        };
        let Some(result) = exit else {
            if tokio::time::timeout(STOP_GRACE, &mut worker).await.is_err() {
                warn!("listener worker did not stop in time, aborting");
                worker.abort();
                let _ = worker.await;
            }
            return;
        };

        match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => error!("watch event error: {}", e),
            Err(e) if e.is_panic() => error!("listener worker panicked"),
            Err(_) => return,
        }

        if *stop.borrow() {
            return;
        }
        *ctx.state.write() = ListenerState::Starting;
        if !ctx.restart_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(ctx.restart_delay) => {}
                _ = stop.changed() => return,
            }
        }
    }
}

/// One subscription's lifetime. Returns `Ok` only when asked to stop.
async fn run_worker(
    ctx: WorkerContext,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ListenerError> {
    ctx.chain.fetch_metadata().await?;

    let key = StorageKey::system_events();
    let mut changes = ctx.chain.subscribe_storage(vec![key.clone()]).await?;
    *ctx.state.write() = ListenerState::Running;
    info!("subscribed to chain events");

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => return Ok(()),
            item = changes.next() => match item {
                Some(Ok(set)) => process_change_set(&ctx, &key, &set).await,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ListenerError::SubscriptionClosed),
            },
        }
    }
}

/// Decode and dispatch one block's changes. Failures here skip the change
/// (or the whole set) and never end the worker.
async fn process_change_set(ctx: &WorkerContext, key: &StorageKey, set: &StorageChangeSet) {
    info!(block = %set.block_hex(), "watch");

    let payloads: Vec<&[u8]> = set
        .changes
        .iter()
        .filter(|c| c.key == *key)
        .filter_map(|c| c.data.as_deref())
        .collect();
    if payloads.is_empty() {
        return;
    }

    // metadata may change with a runtime upgrade
    let metadata = match ctx.chain.fetch_metadata().await {
        Ok(m) => m,
        Err(e) => {
            error!(block = %set.block_hex(), "get metadata error: {}", e);
            return;
        }
    };

    for raw in payloads {
        match EventDecoder::decode(raw, &metadata) {
            Ok(events) => {
                debug!(count = events.len(), "decoded events");
                ctx.dispatcher.dispatch_all(&events).await;
            }
            Err(e) => warn!(block = %set.block_hex(), "skipping undecodable change: {}", e),
        }
    }
}

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<ChainListener>();
    }
};
