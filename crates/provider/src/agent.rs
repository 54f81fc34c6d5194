//! Wiring of the provider agent from its configuration and collaborators.

use std::sync::Arc;
use std::time::Duration;

use chainlease_common::{ConfigError, ProviderConfig, RegistrationStore, StateError};
use thiserror::Error;
use tracing::info;

use crate::agreement::AgreementLifecycle;
use crate::bundle_fetcher::IpfsFetcher;
use crate::chain::ChainClient;
use crate::deployment::{DeploymentController, DeploymentRunner, DockerRunner};
use crate::dispatcher::OrderDispatcher;
use crate::forwarding::PortForwarder;
use crate::listener::{ChainListener, ListenerError};
use crate::registration::RegistrationController;
use crate::report::ReportClient;
use crate::timers::TimerRegistry;
use crate::workload::WorkloadManager;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to set up deployment runner: {0}")]
    Runner(#[from] anyhow::Error),
}

/// External systems the agent talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainClient>,
    pub report: Arc<dyn ReportClient>,
    pub workloads: Arc<dyn WorkloadManager>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub deployments: Arc<dyn DeploymentRunner>,
}

pub struct ProviderAgent {
    config: ProviderConfig,
    store: Arc<RegistrationStore>,
    timers: TimerRegistry,
    lifecycle: AgreementLifecycle,
    deployments: Arc<DeploymentController>,
    listener: ChainListener,
}

impl ProviderAgent {
    /// Validate `config`, open the registration state at `config.state_path`
    /// and wire everything up.
    pub fn open(config: ProviderConfig, collaborators: Collaborators) -> Result<Self, AgentError> {
        config.validate()?;
        let store = Arc::new(RegistrationStore::open(&config.state_path)?);
        Ok(Self::new(config, store, collaborators))
    }

    pub fn new(
        config: ProviderConfig,
        store: Arc<RegistrationStore>,
        collaborators: Collaborators,
    ) -> Self {
        let Collaborators {
            chain,
            report,
            workloads,
            forwarder,
            deployments,
        } = collaborators;

        let timers = TimerRegistry::new();
        let lifecycle = AgreementLifecycle::new(
            Arc::clone(&report),
            Arc::clone(&workloads),
            forwarder,
            Arc::clone(&store),
            timers.clone(),
            Duration::from_secs(config.listener.heartbeat_interval_secs),
            config.api_port,
        );
        let deployments = Arc::new(DeploymentController::new(deployments));
        let dispatcher = Arc::new(OrderDispatcher::new(
            config.identity.peer_id.clone(),
            config.vm.clone(),
            Arc::clone(&store),
            workloads,
            lifecycle.clone(),
            Arc::clone(&deployments),
        ));
        let registration = Arc::new(RegistrationController::new(
            &config,
            report,
            Arc::clone(&store),
        ));
        let listener = ChainListener::new(
            chain,
            dispatcher,
            registration,
            Duration::from_millis(config.listener.restart_delay_ms),
        );

        Self {
            config,
            store,
            timers,
            lifecycle,
            deployments,
            listener,
        }
    }

    /// Docker-backed runner fetching compose bundles from the configured
    /// IPFS node.
    pub fn docker_runner(config: &ProviderConfig) -> Result<DockerRunner, AgentError> {
        let fetcher = IpfsFetcher::new(config.ipfs.api_url.clone())?;
        Ok(DockerRunner::new(
            config.ipfs.bundle_dir.clone(),
            Arc::new(fetcher),
        ))
    }

    /// Start listening, then re-arm an agreement left live by a previous run.
    pub async fn start(&self) -> Result<(), ListenerError> {
        info!(peer_id = %self.config.identity.peer_id, "starting provider agent");
        self.listener.start().await?;
        self.resume_agreement().await;
        Ok(())
    }

    async fn resume_agreement(&self) {
        let state = self.store.snapshot();
        if !state.has_live_agreement() || self.lifecycle.is_armed(state.agreement_index) {
            return;
        }
        info!(
            agreement_index = state.agreement_index,
            order_index = state.order_index,
            "resuming persisted agreement"
        );
        self.lifecycle
            .activate(state.agreement_index, state.order_index)
            .await;
    }

    /// Stop listening and drop every agreement timer. The registration
    /// record is kept, so the next `start` resumes a live agreement.
    pub async fn shutdown(&self) {
        self.listener.stop().await;
        self.timers.cancel_all();
        info!("provider agent stopped");
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RegistrationStore> {
        &self.store
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.timers
    }

    pub fn deployments(&self) -> &Arc<DeploymentController> {
        &self.deployments
    }

    pub fn listener(&self) -> &ChainListener {
        &self.listener
    }
}
