//! # Chain Client Contract
//!
//! The listener needs exactly two things from a chain client: the current
//! event metadata, and a subscription to raw storage changes at a set of keys.
//! [`ChainClient`] captures that contract; consensus, signing and metadata
//! parsing stay inside the concrete client.
//!
//! ```text
//! ChainClient::subscribe_storage([SYSTEM_EVENTS_KEY])
//!      │
//!      ▼
//! StorageChangeStream ──► StorageChangeSet { block, changes: [(key, data?)] }
//! ```
//!
//! [`MockChainClient`] scripts metadata failures, subscription failures and
//! change-set deliveries for tests.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;

use crate::events::EventMetadata;

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// Storage key of `System.Events`: `twox128("System") ++ twox128("Events")`.
pub const SYSTEM_EVENTS_KEY: [u8; 32] = [
    0x26, 0xaa, 0x39, 0x4e, 0xea, 0x56, 0x30, 0xe0, 0x7c, 0x48, 0xae, 0x0c, 0x95, 0x58, 0xce, 0xf7,
    0x80, 0xd4, 0x1e, 0x5e, 0x16, 0x05, 0x67, 0x65, 0xbc, 0x84, 0x61, 0x85, 0x10, 0x72, 0xc9, 0xd7,
];

/// Raw storage key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(pub Vec<u8>);

impl StorageKey {
    pub fn system_events() -> Self {
        StorageKey(SYSTEM_EVENTS_KEY.to_vec())
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey(0x{})", hex::encode(&self.0))
    }
}

/// A single changed key. `data` is `None` when the key was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: StorageKey,
    pub data: Option<Vec<u8>>,
}

/// All changes at the subscribed keys in one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChangeSet {
    pub block: [u8; 32],
    pub changes: Vec<StorageChange>,
}

impl StorageChangeSet {
    pub fn block_hex(&self) -> String {
        format!("0x{}", hex::encode(self.block))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain connection error: {0}")]
    Connection(String),

    #[error("failed to fetch metadata: {0}")]
    Metadata(String),

    #[error("subscription failed: {0}")]
    Subscription(String),
}

pub type StorageChangeStream =
    Pin<Box<dyn Stream<Item = Result<StorageChangeSet, ChainError>> + Send>>;

// ════════════════════════════════════════════════════════════════════════════════
// CLIENT TRAIT
// ════════════════════════════════════════════════════════════════════════════════

/// Read-side chain access used by the listener.
///
/// Implementations must not retry internally; the listener's supervisor owns
/// the retry policy.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest event metadata of the runtime.
    async fn fetch_metadata(&self) -> Result<EventMetadata, ChainError>;

    /// Subscribe to changes at `keys`. The stream ends or yields an error when
    /// the subscription drops.
    async fn subscribe_storage(&self, keys: Vec<StorageKey>)
        -> Result<StorageChangeStream, ChainError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCK CLIENT
// ════════════════════════════════════════════════════════════════════════════════

type ChangeSender = mpsc::UnboundedSender<Result<StorageChangeSet, ChainError>>;

/// Scriptable in-memory chain client.
///
/// Each successful `subscribe_storage` opens a fresh channel; `emit` and
/// `fail_subscription` feed the most recent one.
pub struct MockChainClient {
    metadata: Mutex<EventMetadata>,
    metadata_failures: Mutex<VecDeque<ChainError>>,
    subscribe_failures: Mutex<VecDeque<ChainError>>,
    subscribe_panics: AtomicUsize,
    metadata_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    current: Mutex<Option<ChangeSender>>,
    subscribed_keys: Mutex<Vec<Vec<StorageKey>>>,
}

impl MockChainClient {
    pub fn new(metadata: EventMetadata) -> Self {
        Self {
            metadata: Mutex::new(metadata),
            metadata_failures: Mutex::new(VecDeque::new()),
            subscribe_failures: Mutex::new(VecDeque::new()),
            subscribe_panics: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            current: Mutex::new(None),
            subscribed_keys: Mutex::new(Vec::new()),
        }
    }

    /// Next `fetch_metadata` call fails with `err`. Queued failures are consumed FIFO.
    pub fn fail_next_metadata(&self, err: ChainError) {
        self.metadata_failures.lock().push_back(err);
    }

    /// Next `subscribe_storage` call fails with `err`.
    pub fn fail_next_subscribe(&self, err: ChainError) {
        self.subscribe_failures.lock().push_back(err);
    }

    /// The next `n` calls to `subscribe_storage` panic.
    pub fn panic_next_subscribes(&self, n: usize) {
        self.subscribe_panics.fetch_add(n, Ordering::SeqCst);
    }

    pub fn set_metadata(&self, metadata: EventMetadata) {
        *self.metadata.lock() = metadata;
    }

    /// Deliver a change set on the live subscription. Returns false when no
    /// subscription is open.
    pub fn emit(&self, set: StorageChangeSet) -> bool {
        self.send(Ok(set))
    }

    /// Push an error item into the live subscription.
    pub fn fail_subscription(&self, err: ChainError) -> bool {
        self.send(Err(err))
    }

    /// Drop the live subscription so its stream ends.
    pub fn close_subscription(&self) {
        self.current.lock().take();
    }

    fn send(&self, item: Result<StorageChangeSet, ChainError>) -> bool {
        match self.current.lock().as_ref() {
            Some(tx) => tx.unbounded_send(item).is_ok(),
            None => false,
        }
    }

    pub fn has_subscription(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn subscribed_keys(&self) -> Vec<Vec<StorageKey>> {
        self.subscribed_keys.lock().clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn fetch_metadata(&self) -> Result<EventMetadata, ChainError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.metadata_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.metadata.lock().clone())
    }

    async fn subscribe_storage(
        &self,
        keys: Vec<StorageKey>,
    ) -> Result<StorageChangeStream, ChainError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let should_panic = self
            .subscribe_panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_panic {
            panic!("mock chain client: scripted subscribe panic");
        }
        if let Some(err) = self.subscribe_failures.lock().pop_front() {
            return Err(err);
        }
        self.subscribed_keys.lock().push(keys);
        let (tx, rx) = mpsc::unbounded();
        *self.current.lock() = Some(tx);
        Ok(Box::pin(rx))
    }
}
