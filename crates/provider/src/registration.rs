//! Resource (de)registration with the chain.

use std::sync::Arc;

use chainlease_common::{ProviderConfig, RegistrationStore, StateError};
use thiserror::Error;
use tracing::{error, info};

use crate::report::{ReportClient, ReportError, ResourceInfo};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("resource registration rejected: {0}")]
    Report(#[from] ReportError),

    #[error("failed to record resource index: {0}")]
    State(#[from] StateError),
}

pub struct RegistrationController {
    info: ResourceInfo,
    report: Arc<dyn ReportClient>,
    store: Arc<RegistrationStore>,
}

impl RegistrationController {
    pub fn new(
        config: &ProviderConfig,
        report: Arc<dyn ReportClient>,
        store: Arc<RegistrationStore>,
    ) -> Self {
        Self {
            info: resource_info(config),
            report,
            store,
        }
    }

    pub fn resource_info(&self) -> &ResourceInfo {
        &self.info
    }

    /// Register the resource and persist the returned index. Safe to repeat.
    pub async fn register(&self) -> Result<u64, RegistrationError> {
        let resource_index = self.report.register_resource(&self.info).await?;
        self.store.update(|s| s.resource_index = resource_index)?;
        info!(resource_index, peer_id = %self.info.peer_id, "resource registered");
        Ok(resource_index)
    }

    /// Deregister by the persisted index. Failures are logged, never returned.
    pub async fn deregister(&self) {
        let resource_index = self.store.snapshot().resource_index;
        match self.report.remove_resource(resource_index).await {
            Ok(()) => info!(resource_index, "resource deregistered"),
            Err(e) => error!(resource_index, "resource deregistration failed: {}", e),
        }
    }
}

/// Units above `u8::MAX` are advertised as `u8::MAX`.
fn resource_info(config: &ProviderConfig) -> ResourceInfo {
    ResourceInfo {
        peer_id: config.identity.peer_id.clone(),
        public_ip: config.public_ip.clone(),
        cpu: u8::try_from(config.vm.cpu).unwrap_or(u8::MAX),
        memory: u8::try_from(config.vm.mem).unwrap_or(u8::MAX),
    }
}
