//! # Order Dispatcher
//!
//! Applies decoded chain events to the local registration.
//!
//! ## Matching Rules
//!
//! | Event                 | Matches when                                | Effect |
//! |-----------------------|---------------------------------------------|--------|
//! | `OrderCreated`        | resource index == persisted                 | persist order, submit `create` |
//! | `OrderExecuted`       | resource and order index == persisted       | persist agreement, activate it (again if not armed) |
//! | `OrderRenewed`        | resource index == persisted                 | submit `renew`, re-arm expiration |
//! | `OrderWithdrawn`      | order index == persisted (non-zero)         | submit `destroy`, release and drop agreement |
//! | `AgreementCancelled`  | same as `OrderWithdrawn`                    | same as `OrderWithdrawn` |
//! | `DeploymentRequested` | target peer == this agent                   | start deployment |
//! | `DeploymentStopped`   | target peer == this agent                   | stop deployment |
//!
//! Everything else is logged only. A mismatch is not an error.
//!
//! Each rule reads a fresh snapshot of the registration state. The listener
//! dispatches one change set at a time, so rules never interleave with each
//! other; expiration timers write through the same store and are serialized
//! by it.

use std::sync::Arc;

use chainlease_common::{ChainRegistrationState, RegistrationStore, VmConfig};
use tracing::{debug, error, info, warn};

use crate::agreement::AgreementLifecycle;
use crate::deployment::{DeploymentController, DeploymentSpec};
use crate::events::{
    account_to_address, AgreementCancelled, ChainEvent, DeploymentRequested, DeploymentStopped,
    OrderCreated, OrderExecuted, OrderRenewed, OrderWithdrawn,
};
use crate::workload::{LifecycleRequest, LifecycleTag, WorkloadManager};

/// What dispatching a single event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event matched and its effects were applied.
    Handled,
    /// The event did not concern this agent.
    Ignored,
    /// Informational event, logged only.
    Observed,
    /// The event matched but applying it failed.
    Failed,
}

pub struct OrderDispatcher {
    peer_id: String,
    vm: VmConfig,
    store: Arc<RegistrationStore>,
    workloads: Arc<dyn WorkloadManager>,
    lifecycle: AgreementLifecycle,
    deployments: Arc<DeploymentController>,
}

impl OrderDispatcher {
    pub fn new(
        peer_id: impl Into<String>,
        vm: VmConfig,
        store: Arc<RegistrationStore>,
        workloads: Arc<dyn WorkloadManager>,
        lifecycle: AgreementLifecycle,
        deployments: Arc<DeploymentController>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            vm,
            store,
            workloads,
            lifecycle,
            deployments,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Dispatch a batch in order.
    pub async fn dispatch_all(&self, events: &[ChainEvent]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.dispatch(event).await);
        }
        outcomes
    }

    pub async fn dispatch(&self, event: &ChainEvent) -> Outcome {
        match event {
            ChainEvent::OrderCreated(e) => self.on_order_created(e).await,
            ChainEvent::OrderExecuted(e) => self.on_order_executed(e).await,
            ChainEvent::OrderRenewed(e) => self.on_order_renewed(e).await,
            ChainEvent::OrderWithdrawn(OrderWithdrawn { order_index, .. }) => {
                info!(order_index, "order withdrawn");
                self.on_cancellation(*order_index).await
            }
            ChainEvent::AgreementCancelled(AgreementCancelled {
                order_index,
                agreement_index,
                ..
            }) => {
                info!(order_index, agreement_index, "agreement cancelled");
                self.on_cancellation(*order_index).await
            }
            ChainEvent::DeploymentRequested(e) => self.on_deployment_requested(e).await,
            ChainEvent::DeploymentStopped(e) => self.on_deployment_stopped(e).await,
            ChainEvent::ResourceHeartbeat(e) => {
                info!(peer_id = %e.peer_id, dapps = ?e.dapps, "resource heartbeat event");
                Outcome::Observed
            }
            ChainEvent::DeploymentHeartbeat(e) => {
                info!(dapp = %e.dapp_name, "deployment heartbeat event");
                Outcome::Observed
            }
            ChainEvent::DeploymentRedistributed(e) => {
                info!(dapps = ?e.dapps, "deployment redistribution event");
                Outcome::Observed
            }
            ChainEvent::DeploymentEnded(e) => {
                info!(dapp = %e.dapp_name, dapp_index = e.dapp_index, "deployment ended event");
                Outcome::Observed
            }
        }
    }

    fn vm_request(&self, tag: LifecycleTag, order_no: u64) -> LifecycleRequest {
        LifecycleRequest {
            tag,
            cpu: self.vm.cpu,
            mem: self.vm.mem,
            disk: self.vm.disk,
            order_no,
            system: self.vm.system.clone(),
            image: self.vm.image.clone(),
            public_key: String::new(),
            deploy_type: 0,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // ORDERS
    // ────────────────────────────────────────────────────────────────────────

    async fn on_order_created(&self, e: &OrderCreated) -> Outcome {
        let state = self.store.snapshot();
        if e.resource_index != state.resource_index {
            info!(
                resource_index = e.resource_index,
                ours = state.resource_index,
                "order for another resource, ignoring"
            );
            return Outcome::Ignored;
        }

        info!(order_index = e.order_index, "taking order");
        let account = account_to_address(&e.account);
        let persisted = self.store.update(|s| {
            s.order_index = e.order_index;
            s.account_address = account;
            s.deploy_type = e.deploy_type;
        });
        if let Err(err) = persisted {
            error!(order_index = e.order_index, "failed to record order: {}", err);
            return Outcome::Failed;
        }

        let mut request = self.vm_request(LifecycleTag::Create, e.order_index);
        request.public_key = e.public_key.clone();
        request.deploy_type = e.deploy_type;
        self.submit(request).await
    }

    async fn on_order_executed(&self, e: &OrderExecuted) -> Outcome {
        let state = self.store.snapshot();
        if e.resource_index != state.resource_index || e.order_index != state.order_index {
            info!(
                order_index = e.order_index,
                resource_index = e.resource_index,
                "executed order is not ours, ignoring"
            );
            return Outcome::Ignored;
        }
        if e.agreement_index == state.agreement_index {
            if self.lifecycle.is_armed(e.agreement_index) {
                debug!(agreement_index = e.agreement_index, "agreement already active");
                return Outcome::Ignored;
            }
            // recorded by an activation that never finished
            warn!(agreement_index = e.agreement_index, "agreement recorded but not armed, activating");
            self.lifecycle.activate(e.agreement_index, e.order_index).await;
            return Outcome::Handled;
        }

        if let Err(err) = self.store.update(|s| s.agreement_index = e.agreement_index) {
            error!(agreement_index = e.agreement_index, "failed to record agreement: {}", err);
            return Outcome::Failed;
        }
        if state.has_live_agreement() {
            warn!(
                previous = state.agreement_index,
                agreement_index = e.agreement_index,
                "agreement superseded"
            );
            self.lifecycle.cancel(state.agreement_index);
        }

        self.lifecycle.activate(e.agreement_index, e.order_index).await;
        Outcome::Handled
    }

    async fn on_order_renewed(&self, e: &OrderRenewed) -> Outcome {
        let state = self.store.snapshot();
        if e.resource_index != state.resource_index {
            info!(resource_index = e.resource_index, "renewal for another resource, ignoring");
            return Outcome::Ignored;
        }

        info!(order_index = e.order_index, "order renewed");
        let outcome = self
            .submit(LifecycleRequest::bare(LifecycleTag::Renew, e.order_index))
            .await;

        if let Err(err) = self.store.update(|s| s.renew_order_index = e.order_index) {
            error!(order_index = e.order_index, "failed to record renewal: {}", err);
            return Outcome::Failed;
        }
        if state.has_live_agreement()
            && !self
                .lifecycle
                .schedule_expiration(state.agreement_index, state.order_index)
                .await
        {
            return Outcome::Failed;
        }
        outcome
    }

    /// Shared path for withdrawal and agreement cancellation.
    async fn on_cancellation(&self, order_index: u64) -> Outcome {
        let state = self.store.snapshot();
        if order_index == 0 || order_index != state.order_index {
            info!(order_index, ours = state.order_index, "cancellation for another order, ignoring");
            return Outcome::Ignored;
        }

        let outcome = self
            .submit(self.vm_request(LifecycleTag::Destroy, order_index))
            .await;
        if outcome == Outcome::Failed {
            return outcome;
        }

        self.drop_agreement(&state).await
    }

    async fn drop_agreement(&self, state: &ChainRegistrationState) -> Outcome {
        if !state.has_live_agreement() {
            return Outcome::Handled;
        }
        let live = state.agreement_index;
        self.lifecycle.release(live).await;

        let mut cleared = state.clone();
        cleared.agreement_index = 0;
        cleared.renew_order_index = 0;
        match self.store.compare_and_swap(state, cleared) {
            Ok(true) => Outcome::Handled,
            Ok(false) => {
                debug!(agreement_index = live, "registration changed during cancellation");
                Outcome::Handled
            }
            Err(err) => {
                error!(agreement_index = live, "failed to clear agreement: {}", err);
                Outcome::Failed
            }
        }
    }

    async fn submit(&self, request: LifecycleRequest) -> Outcome {
        let tag = request.tag;
        let order_no = request.order_no;
        match self.workloads.submit(request).await {
            Ok(()) => {
                info!(?tag, order_no, "lifecycle request submitted");
                Outcome::Handled
            }
            Err(err) => {
                error!(?tag, order_no, "lifecycle request failed: {}", err);
                Outcome::Failed
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // DIRECT DEPLOYMENTS
    // ────────────────────────────────────────────────────────────────────────

    async fn on_deployment_requested(&self, e: &DeploymentRequested) -> Outcome {
        if e.peer_id != self.peer_id {
            info!(target_peer = %e.peer_id, dapp_index = e.dapp_index, "deployment for another peer, ignoring");
            return Outcome::Ignored;
        }
        let spec = match DeploymentSpec::from_event(e) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(dapp_index = e.dapp_index, "bad deployment request: {}", err);
                return Outcome::Failed;
            }
        };
        match self.deployments.start(spec).await {
            Ok(_) => Outcome::Handled,
            Err(err) => {
                error!(dapp_index = e.dapp_index, "deployment start failed: {}", err);
                Outcome::Failed
            }
        }
    }

    async fn on_deployment_stopped(&self, e: &DeploymentStopped) -> Outcome {
        if e.peer_id != self.peer_id {
            info!(target_peer = %e.peer_id, dapp_index = e.dapp_index, "stop for another peer, ignoring");
            return Outcome::Ignored;
        }
        match self.deployments.stop(e.dapp_index).await {
            Ok(()) => Outcome::Handled,
            Err(err) => {
                warn!(dapp_index = e.dapp_index, "deployment stop failed: {}", err);
                Outcome::Failed
            }
        }
    }
}
