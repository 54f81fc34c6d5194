//! # Report Client
//!
//! Write-side chain calls the agent makes: resource (de)registration,
//! agreement heartbeats, resource status changes and the overdue query used to
//! schedule expiration.
//!
//! ## Contract
//!
//! - Calls are single attempts. No retry, no timeout policy at this layer.
//! - `calculate_instance_overdue` returns signed milliseconds until the order's
//!   purchased duration elapses; zero or negative means already expired.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("report transport error: {0}")]
    Transport(String),

    #[error("chain rejected call: {0}")]
    Rejected(String),
}

/// What the agent advertises when registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub peer_id: String,
    pub public_ip: String,
    pub cpu: u8,
    pub memory: u8,
}

#[async_trait]
pub trait ReportClient: Send + Sync {
    /// Register (or re-register) the resource. Returns the chain-assigned
    /// resource index.
    async fn register_resource(&self, info: &ResourceInfo) -> Result<u64, ReportError>;

    async fn remove_resource(&self, resource_index: u64) -> Result<(), ReportError>;

    /// Liveness report for a running agreement.
    async fn report_heartbeat(&self, agreement_index: u64) -> Result<(), ReportError>;

    /// Mark the resource unused.
    async fn change_resource_status(&self, resource_index: u64) -> Result<(), ReportError>;

    /// Signed milliseconds until the order expires.
    async fn calculate_instance_overdue(&self, order_index: u64) -> Result<i64, ReportError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCK CLIENT
// ════════════════════════════════════════════════════════════════════════════════

/// Call recorded by [`MockReportClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportCall {
    Register(ResourceInfo),
    Remove(u64),
    Heartbeat(u64),
    ChangeStatus(u64),
    Overdue(u64),
}

/// Records every call; failures and overdue values are scripted.
pub struct MockReportClient {
    calls: Mutex<Vec<ReportCall>>,
    next_resource_index: AtomicU64,
    register_failures: Mutex<VecDeque<ReportError>>,
    heartbeat_failures: Mutex<VecDeque<ReportError>>,
    status_failures: Mutex<VecDeque<ReportError>>,
    overdue_ms: Mutex<Result<i64, ReportError>>,
}

impl MockReportClient {
    /// `resource_index` is returned by every successful registration.
    pub fn new(resource_index: u64) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_resource_index: AtomicU64::new(resource_index),
            register_failures: Mutex::new(VecDeque::new()),
            heartbeat_failures: Mutex::new(VecDeque::new()),
            status_failures: Mutex::new(VecDeque::new()),
            overdue_ms: Mutex::new(Ok(3_600_000)),
        }
    }

    pub fn fail_next_register(&self, err: ReportError) {
        self.register_failures.lock().push_back(err);
    }

    pub fn fail_next_heartbeat(&self, err: ReportError) {
        self.heartbeat_failures.lock().push_back(err);
    }

    pub fn fail_next_status_change(&self, err: ReportError) {
        self.status_failures.lock().push_back(err);
    }

    pub fn set_overdue(&self, result: Result<i64, ReportError>) {
        *self.overdue_ms.lock() = result;
    }

    pub fn set_resource_index(&self, index: u64) {
        self.next_resource_index.store(index, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ReportCall> {
        self.calls.lock().clone()
    }

    pub fn heartbeats(&self) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ReportCall::Heartbeat(a) => Some(*a),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ReportCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ReportCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ReportClient for MockReportClient {
    async fn register_resource(&self, info: &ResourceInfo) -> Result<u64, ReportError> {
        self.record(ReportCall::Register(info.clone()));
        if let Some(err) = self.register_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.next_resource_index.load(Ordering::SeqCst))
    }

    async fn remove_resource(&self, resource_index: u64) -> Result<(), ReportError> {
        self.record(ReportCall::Remove(resource_index));
        Ok(())
    }

    async fn report_heartbeat(&self, agreement_index: u64) -> Result<(), ReportError> {
        self.record(ReportCall::Heartbeat(agreement_index));
        match self.heartbeat_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn change_resource_status(&self, resource_index: u64) -> Result<(), ReportError> {
        self.record(ReportCall::ChangeStatus(resource_index));
        match self.status_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn calculate_instance_overdue(&self, order_index: u64) -> Result<i64, ReportError> {
        self.record(ReportCall::Overdue(order_index));
        self.overdue_ms.lock().clone()
    }
}
