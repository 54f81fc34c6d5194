//! Exposure of local services over the peer network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Protocol tag under which the rented workload's shell is exposed.
pub const SSH_PROTOCOL: &str = "/x/ssh";

/// Multiaddr of the forwarded shell for a node whose API listens on `api_port`.
pub fn shell_target_address(api_port: u16) -> String {
    format!("/ip4/127.0.0.1/tcp/{}", u32::from(api_port) + 1)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("p2p forwarding error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn listen(&self, protocol: &str, target: &str) -> Result<(), ForwardError>;

    /// Close listeners for `target`. Returns how many were closed.
    async fn close(&self, target: &str) -> Result<usize, ForwardError>;
}

/// In-memory forwarder: `target -> protocol`.
#[derive(Default)]
pub struct MockPortForwarder {
    listeners: Mutex<HashMap<String, String>>,
    fail_listen: Mutex<Option<ForwardError>>,
    hold_listen: Mutex<Option<Arc<Notify>>>,
}

impl MockPortForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_listen(&self, err: ForwardError) {
        *self.fail_listen.lock() = Some(err);
    }

    /// Make the next `listen` wait until the returned gate is notified.
    pub fn hold_next_listen(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.hold_listen.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn is_listening(&self, target: &str) -> bool {
        self.listeners.lock().contains_key(target)
    }

    pub fn protocol_for(&self, target: &str) -> Option<String> {
        self.listeners.lock().get(target).cloned()
    }
}

#[async_trait]
impl PortForwarder for MockPortForwarder {
    async fn listen(&self, protocol: &str, target: &str) -> Result<(), ForwardError> {
        if let Some(err) = self.fail_listen.lock().take() {
            return Err(err);
        }
        let hold = self.hold_listen.lock().take();
        if let Some(gate) = hold {
            gate.notified().await;
        }
        self.listeners
            .lock()
            .insert(target.to_string(), protocol.to_string());
        Ok(())
    }

    async fn close(&self, target: &str) -> Result<usize, ForwardError> {
        Ok(usize::from(self.listeners.lock().remove(target).is_some()))
    }
}
