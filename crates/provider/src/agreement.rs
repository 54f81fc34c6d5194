//! # Agreement Lifecycle
//!
//! Everything that happens to an agreement after its order executed:
//!
//! ```text
//! activate(agreement, order)
//!   ├─ forwarder.listen("/x/ssh", shell target)      failure logged, continue
//!   ├─ heartbeat ticker  ─► report_heartbeat(agreement) every period
//!   └─ expiration timer  ─► expire(agreement, order) after calculate_instance_overdue(order)
//!
//! release(agreement)                                cancellation by the chain
//!   ├─ cancel heartbeat and expiration
//!   └─ forwarder.close(shell target)                 failure logged
//!
//! expire(agreement, order)                           no-op unless agreement is still live
//!   ├─ cancel heartbeat
//!   ├─ forwarder.close(shell target)
//!   ├─ workloads.stop(order-N) / workloads.destroy(order-N)
//!   ├─ report.change_resource_status(resource)
//!   └─ store.reset_agreement(agreement)
//! ```
//!
//! Teardown steps are independent: a failing step is logged and recorded in
//! [`ExpiryOutcome::TornDown`], the remaining steps still run.

use std::sync::Arc;
use std::time::Duration;

use chainlease_common::RegistrationStore;
use tracing::{debug, error, info, warn};

use crate::forwarding::{shell_target_address, PortForwarder, SSH_PROTOCOL};
use crate::report::ReportClient;
use crate::timers::{TimerKind, TimerRegistry};
use crate::workload::{deployment_name, WorkloadManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    CloseForward,
    StopWorkload,
    DestroyWorkload,
    ReleaseResource,
    ResetState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The agreement was no longer live; nothing was touched.
    Stale,
    TornDown { failed_steps: Vec<TeardownStep> },
}

struct Inner {
    report: Arc<dyn ReportClient>,
    workloads: Arc<dyn WorkloadManager>,
    forwarder: Arc<dyn PortForwarder>,
    store: Arc<RegistrationStore>,
    timers: TimerRegistry,
    heartbeat_period: Duration,
    shell_target: String,
}

/// Cloneable handle; timer callbacks hold their own clone.
#[derive(Clone)]
pub struct AgreementLifecycle {
    inner: Arc<Inner>,
}

impl AgreementLifecycle {
    pub fn new(
        report: Arc<dyn ReportClient>,
        workloads: Arc<dyn WorkloadManager>,
        forwarder: Arc<dyn PortForwarder>,
        store: Arc<RegistrationStore>,
        timers: TimerRegistry,
        heartbeat_period: Duration,
        api_port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                report,
                workloads,
                forwarder,
                store,
                timers,
                heartbeat_period,
                shell_target: shell_target_address(api_port),
            }),
        }
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.inner.timers
    }

    /// Bring a freshly executed agreement up: shell forwarding, heartbeat
    /// ticker and expiration timer.
    pub async fn activate(&self, agreement_index: u64, order_index: u64) {
        let inner = &self.inner;
        match inner.forwarder.listen(SSH_PROTOCOL, &inner.shell_target).await {
            Ok(()) => debug!(target_addr = %inner.shell_target, "shell forwarded"),
            Err(e) => error!(agreement_index, "shell forwarding failed: {}", e),
        }

        self.start_heartbeat(agreement_index);
        self.schedule_expiration(agreement_index, order_index).await;
        info!(agreement_index, order_index, "agreement activated");
    }

    pub fn start_heartbeat(&self, agreement_index: u64) {
        let report = Arc::clone(&self.inner.report);
        self.inner.timers.register_heartbeat(
            agreement_index,
            self.inner.heartbeat_period,
            move |agreement| {
                let report = Arc::clone(&report);
                async move {
                    match report.report_heartbeat(agreement).await {
                        Ok(()) => debug!(agreement_index = agreement, "heartbeat reported"),
                        Err(e) => error!(agreement_index = agreement, "heartbeat failed: {}", e),
                    }
                }
            },
        );
    }

    /// (Re)arm the expiration timer from the order's remaining duration.
    /// Returns false when the duration could not be computed; no timer is
    /// armed in that case and any previous one is left in place.
    pub async fn schedule_expiration(&self, agreement_index: u64, order_index: u64) -> bool {
        let overdue_ms = match self.inner.report.calculate_instance_overdue(order_index).await {
            Ok(ms) => ms,
            Err(e) => {
                error!(agreement_index, order_index, "overdue calculation failed: {}", e);
                return false;
            }
        };
        let delay = overdue_delay(overdue_ms);
        if delay.is_zero() {
            warn!(agreement_index, order_index, overdue_ms, "order already expired");
        }

        let this = self.clone();
        self.inner
            .timers
            .register_expiration(agreement_index, delay, move |agreement| async move {
                let outcome = this.expire(agreement, order_index).await;
                debug!(agreement_index = agreement, ?outcome, "expiration handled");
            });
        true
    }

    /// Cancel every timer of the agreement.
    pub fn cancel(&self, agreement_index: u64) -> bool {
        self.inner.timers.cancel(agreement_index)
    }

    /// True once activation armed both the heartbeat and the expiration.
    pub fn is_armed(&self, agreement_index: u64) -> bool {
        let timers = &self.inner.timers;
        timers.is_registered(agreement_index, TimerKind::Heartbeat)
            && timers.is_registered(agreement_index, TimerKind::Expiration)
    }

    /// Undo what activation set up locally: timers and the shell forward.
    /// The workload itself is destroyed by the caller's lifecycle request.
    pub async fn release(&self, agreement_index: u64) {
        let inner = &self.inner;
        inner.timers.cancel(agreement_index);
        match inner.forwarder.close(&inner.shell_target).await {
            Ok(closed) => debug!(agreement_index, closed, "shell forward closed"),
            Err(e) => error!(agreement_index, "closing shell forward failed: {}", e),
        }
    }

    /// Best-effort teardown of an expired agreement.
    pub async fn expire(&self, agreement_index: u64, order_index: u64) -> ExpiryOutcome {
        let inner = &self.inner;
        let state = inner.store.snapshot();
        if agreement_index == 0 || state.agreement_index != agreement_index {
            info!(
                agreement_index,
                live = state.agreement_index,
                "expiration for an agreement that is no longer live"
            );
            inner.timers.cancel(agreement_index);
            return ExpiryOutcome::Stale;
        }

        info!(agreement_index, order_index, "agreement expired, tearing down");
        inner.timers.cancel_kind(agreement_index, TimerKind::Heartbeat);

        let name = deployment_name(order_index);
        let mut failed_steps = Vec::new();

        if let Err(e) = inner.forwarder.close(&inner.shell_target).await {
            error!(agreement_index, "closing shell forward failed: {}", e);
            failed_steps.push(TeardownStep::CloseForward);
        }
        if let Err(e) = inner.workloads.stop(&name).await {
            error!(agreement_index, %name, "stopping workload failed: {}", e);
            failed_steps.push(TeardownStep::StopWorkload);
        }
        if let Err(e) = inner.workloads.destroy(&name).await {
            error!(agreement_index, %name, "destroying workload failed: {}", e);
            failed_steps.push(TeardownStep::DestroyWorkload);
        }
        if let Err(e) = inner.report.change_resource_status(state.resource_index).await {
            error!(
                agreement_index,
                resource_index = state.resource_index,
                "releasing resource failed: {}",
                e
            );
            failed_steps.push(TeardownStep::ReleaseResource);
        }
        match inner.store.reset_agreement(agreement_index) {
            Ok(true) => {}
            Ok(false) => debug!(agreement_index, "agreement replaced during teardown"),
            Err(e) => {
                error!(agreement_index, "resetting registration state failed: {}", e);
                failed_steps.push(TeardownStep::ResetState);
            }
        }

        ExpiryOutcome::TornDown { failed_steps }
    }
}

/// Non-positive overdue values mean the order is already past its end.
fn overdue_delay(overdue_ms: i64) -> Duration {
    u64::try_from(overdue_ms)
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::MockPortForwarder;
    use crate::report::{MockReportClient, ReportCall, ReportError};
    use crate::workload::{MockWorkloadManager, WorkloadCall};
    use chainlease_common::ChainRegistrationState;

    struct Fixture {
        report: Arc<MockReportClient>,
        workloads: Arc<MockWorkloadManager>,
        forwarder: Arc<MockPortForwarder>,
        store: Arc<RegistrationStore>,
        lifecycle: AgreementLifecycle,
    }

    fn fixture() -> Fixture {
        let report = Arc::new(MockReportClient::new(7));
        let workloads = Arc::new(MockWorkloadManager::new());
        let forwarder = Arc::new(MockPortForwarder::new());
        let store = Arc::new(RegistrationStore::in_memory(ChainRegistrationState {
            resource_index: 7,
            order_index: 42,
            agreement_index: 3,
            ..Default::default()
        }));
        let lifecycle = AgreementLifecycle::new(
            report.clone(),
            workloads.clone(),
            forwarder.clone(),
            store.clone(),
            TimerRegistry::new(),
            Duration::from_secs(175),
            10771,
        );
        Fixture {
            report,
            workloads,
            forwarder,
            store,
            lifecycle,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_overdue_delay() {
        assert_eq!(overdue_delay(1_500), Duration::from_millis(1_500));
        assert_eq!(overdue_delay(0), Duration::ZERO);
        assert_eq!(overdue_delay(-20_000), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_arms_timers_and_forwarding() {
        let f = fixture();
        f.lifecycle.activate(3, 42).await;

        assert!(f.forwarder.is_listening("/ip4/127.0.0.1/tcp/10772"));
        assert!(f.lifecycle.timers().is_registered(3, TimerKind::Heartbeat));
        assert!(f.lifecycle.timers().is_registered(3, TimerKind::Expiration));
        assert_eq!(f.report.count(|c| *c == ReportCall::Overdue(42)), 1);

        tokio::time::advance(Duration::from_secs(175)).await;
        settle().await;
        assert_eq!(f.report.heartbeats(), vec![3]);
        f.lifecycle.timers().cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarding_failure_does_not_block_activation() {
        let f = fixture();
        f.forwarder
            .fail_next_listen(crate::forwarding::ForwardError::Transport("down".into()));
        f.lifecycle.activate(3, 42).await;
        assert!(f.lifecycle.timers().is_registered(3, TimerKind::Heartbeat));
        f.lifecycle.timers().cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_survives_report_failures() {
        let f = fixture();
        f.report.fail_next_heartbeat(ReportError::Transport("timeout".into()));
        f.report.fail_next_heartbeat(ReportError::Transport("timeout".into()));
        f.lifecycle.start_heartbeat(3);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(175)).await;
            settle().await;
        }
        assert_eq!(f.report.heartbeats(), vec![3, 3, 3]);
        assert!(f.lifecycle.timers().is_registered(3, TimerKind::Heartbeat));
        f.lifecycle.timers().cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_failure_arms_no_expiration() {
        let f = fixture();
        f.report.set_overdue(Err(ReportError::Rejected("no such order".into())));
        assert!(!f.lifecycle.schedule_expiration(3, 42).await);
        assert!(!f.lifecycle.timers().is_registered(3, TimerKind::Expiration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_positive_overdue_tears_down_immediately() {
        let f = fixture();
        f.workloads.insert_live("order-42");
        f.report.set_overdue(Ok(-5_000));
        f.lifecycle.activate(3, 42).await;
        settle().await;

        assert!(!f.workloads.is_live("order-42"));
        assert_eq!(f.store.snapshot().agreement_index, 0);
        assert!(f.lifecycle.timers().agreements().is_empty());
        assert!(!f.forwarder.is_listening("/ip4/127.0.0.1/tcp/10772"));
    }

    #[tokio::test]
    async fn test_expire_is_idempotent() {
        let f = fixture();
        f.workloads.insert_live("order-42");

        let first = f.lifecycle.expire(3, 42).await;
        assert_eq!(first, ExpiryOutcome::TornDown { failed_steps: vec![] });
        assert_eq!(f.report.count(|c| *c == ReportCall::ChangeStatus(7)), 1);
        let s = f.store.snapshot();
        assert_eq!((s.order_index, s.agreement_index, s.resource_index), (0, 0, 7));

        let calls_before = f.workloads.calls().len();
        assert_eq!(f.lifecycle.expire(3, 42).await, ExpiryOutcome::Stale);
        assert_eq!(f.workloads.calls().len(), calls_before);
        assert_eq!(f.report.count(|c| matches!(c, ReportCall::ChangeStatus(_))), 1);
    }

    #[tokio::test]
    async fn test_teardown_continues_past_failures() {
        let f = fixture();
        // workload absent: stop and destroy both fail
        f.report.fail_next_status_change(ReportError::Transport("reset".into()));

        let outcome = f.lifecycle.expire(3, 42).await;
        assert_eq!(
            outcome,
            ExpiryOutcome::TornDown {
                failed_steps: vec![
                    TeardownStep::StopWorkload,
                    TeardownStep::DestroyWorkload,
                    TeardownStep::ReleaseResource,
                ]
            }
        );
        assert_eq!(
            f.workloads.calls(),
            vec![
                WorkloadCall::Stop("order-42".to_string()),
                WorkloadCall::Destroy("order-42".to_string()),
            ]
        );
        assert_eq!(f.store.snapshot().agreement_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_closes_forward_and_disarms() {
        let f = fixture();
        f.lifecycle.activate(3, 42).await;
        assert!(f.lifecycle.is_armed(3));

        f.lifecycle.release(3).await;
        assert!(!f.lifecycle.is_armed(3));
        assert!(f.lifecycle.timers().agreements().is_empty());
        assert!(!f.forwarder.is_listening("/ip4/127.0.0.1/tcp/10772"));
        // workload teardown is left to the destroy request
        assert!(f.workloads.calls().is_empty());
        assert_eq!(f.store.snapshot().agreement_index, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_alone_is_not_armed() {
        let f = fixture();
        f.report.set_overdue(Err(ReportError::Transport("timeout".into())));
        f.lifecycle.activate(3, 42).await;
        assert!(f.lifecycle.timers().is_registered(3, TimerKind::Heartbeat));
        assert!(!f.lifecycle.is_armed(3));
        f.lifecycle.timers().cancel_all();
    }

    #[tokio::test]
    async fn test_expire_zero_agreement_is_stale() {
        let f = fixture();
        f.store.update(|s| s.agreement_index = 0).unwrap();
        assert_eq!(f.lifecycle.expire(0, 42).await, ExpiryOutcome::Stale);
        assert!(f.workloads.calls().is_empty());
    }
}
