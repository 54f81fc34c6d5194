//! # Workload Manager Boundary
//!
//! [`LifecycleRequest`] is the command the dispatcher hands to the external
//! workload manager (the VM / container backend). The manager owns the request
//! once submitted; the agent never inspects it again.
//!
//! ```text
//! OrderDispatcher ──► LifecycleRequest { Create | Renew | Destroy } ──► WorkloadManager
//! AgreementLifecycle (expiry) ──► stop(name) / destroy(name) ──────────► WorkloadManager
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the workload provisioned for an order.
pub fn deployment_name(order_no: u64) -> String {
    format!("order-{}", order_no)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleTag {
    Create,
    Renew,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRequest {
    pub tag: LifecycleTag,
    pub cpu: u64,
    pub mem: u64,
    pub disk: u64,
    pub order_no: u64,
    pub system: String,
    pub image: String,
    /// Renter's access key. Only set for `Create`.
    pub public_key: String,
    pub deploy_type: u32,
}

impl LifecycleRequest {
    /// Request carrying only a tag and an order number.
    pub fn bare(tag: LifecycleTag, order_no: u64) -> Self {
        Self {
            tag,
            cpu: 0,
            mem: 0,
            disk: 0,
            order_no,
            system: String::new(),
            image: String::new(),
            public_key: String::new(),
            deploy_type: 0,
        }
    }

    pub fn deployment_name(&self) -> String {
        deployment_name(self.order_no)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("workload {0} not found")]
    NotFound(String),

    #[error("workload backend error: {0}")]
    Backend(String),

    #[error("workload manager unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait WorkloadManager: Send + Sync {
    /// Hand a lifecycle request to the manager. Returns once the request is
    /// accepted, not once it has been carried out.
    async fn submit(&self, request: LifecycleRequest) -> Result<(), WorkloadError>;

    async fn stop(&self, name: &str) -> Result<(), WorkloadError>;

    async fn destroy(&self, name: &str) -> Result<(), WorkloadError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCK MANAGER
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadCall {
    Submit(LifecycleRequest),
    Stop(String),
    Destroy(String),
}

/// Records calls and tracks which workloads exist. `Create` adds a workload,
/// `Destroy` requests and `destroy` calls remove it; stopping or destroying an
/// absent workload fails with `NotFound`.
#[derive(Default)]
pub struct MockWorkloadManager {
    calls: Mutex<Vec<WorkloadCall>>,
    live: Mutex<HashSet<String>>,
}

impl MockWorkloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a workload already exists.
    pub fn insert_live(&self, name: impl Into<String>) {
        self.live.lock().insert(name.into());
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.lock().contains(name)
    }

    pub fn calls(&self) -> Vec<WorkloadCall> {
        self.calls.lock().clone()
    }

    pub fn requests(&self) -> Vec<LifecycleRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                WorkloadCall::Submit(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn requests_tagged(&self, tag: LifecycleTag) -> Vec<LifecycleRequest> {
        self.requests().into_iter().filter(|r| r.tag == tag).collect()
    }
}

#[async_trait]
impl WorkloadManager for MockWorkloadManager {
    async fn submit(&self, request: LifecycleRequest) -> Result<(), WorkloadError> {
        let name = request.deployment_name();
        match request.tag {
            LifecycleTag::Create => {
                self.live.lock().insert(name);
            }
            LifecycleTag::Destroy => {
                self.live.lock().remove(&name);
            }
            LifecycleTag::Renew => {}
        }
        self.calls.lock().push(WorkloadCall::Submit(request));
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), WorkloadError> {
        self.calls.lock().push(WorkloadCall::Stop(name.to_string()));
        if self.live.lock().contains(name) {
            Ok(())
        } else {
            Err(WorkloadError::NotFound(name.to_string()))
        }
    }

    async fn destroy(&self, name: &str) -> Result<(), WorkloadError> {
        self.calls.lock().push(WorkloadCall::Destroy(name.to_string()));
        if self.live.lock().remove(name) {
            Ok(())
        } else {
            Err(WorkloadError::NotFound(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let mut req = LifecycleRequest::bare(LifecycleTag::Create, 42);
        req.public_key = "pk1".to_string();
        req.deploy_type = 2;
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["tag"], "create");
        assert_eq!(json["order_no"], 42);
        assert_eq!(json["public_key"], "pk1");
        let back: LifecycleRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[tokio::test]
    async fn test_mock_tracks_live_workloads() {
        let mock = MockWorkloadManager::new();
        mock.submit(LifecycleRequest::bare(LifecycleTag::Create, 1)).await.unwrap();
        assert!(mock.is_live("order-1"));

        mock.stop("order-1").await.unwrap();
        mock.destroy("order-1").await.unwrap();
        assert!(!mock.is_live("order-1"));
        assert_eq!(
            mock.destroy("order-1").await,
            Err(WorkloadError::NotFound("order-1".to_string()))
        );
    }
}
