//! # Order Flow Integration Tests
//!
//! Drive a fully wired `ProviderAgent` through the mock chain: every event
//! enters as a SCALE-encoded `System.Events` change set, goes through the
//! supervised listener, the decoder and the dispatcher, and its effects are
//! observed on the mock collaborators and the file-backed state.
//!
//! ## Test Categories
//! - A. Order created / withdrawn scenarios
//! - B. Agreement timers (heartbeat, expiration, idempotence)
//! - C. Direct deployments
//! - D. Persistence and agent restarts

use std::sync::Arc;
use std::time::Duration;

use chainlease_common::{ChainRegistrationState, ProviderConfig, RegistrationStore};
use chainlease_provider::events::{
    AgreementCancelled, DeploymentRequested, DeploymentStopped, EventKind, EventMetadata,
    EventRecordsBuilder, FieldType, OrderCreated, OrderExecuted, OrderWithdrawn,
};
use chainlease_provider::report::ReportCall;
use chainlease_provider::{
    Collaborators, LifecycleRequest, LifecycleTag, ListenerState, MockChainClient,
    MockDeploymentRunner, MockPortForwarder, MockReportClient, MockWorkloadManager,
    ProviderAgent, StorageChange, StorageChangeSet, StorageKey, TimerKind,
};
use codec::Encode;

// ════════════════════════════════════════════════════════════════════════════
// TEST HELPERS
// ════════════════════════════════════════════════════════════════════════════

const PEER: &str = "12D3KooWLocalProvider";
const ORDERS: u8 = 9;
const PROVIDER: u8 = 10;
const BALANCES: u8 = 5;
const SHELL: &str = "/ip4/127.0.0.1/tcp/10772";

fn metadata() -> EventMetadata {
    let mut m = EventMetadata::new();
    for (i, kind) in EventKind::ALL.into_iter().enumerate() {
        let pallet = if kind.names().0 == "ResourceOrder" { ORDERS } else { PROVIDER };
        m.insert_known(pallet, i as u8, kind);
    }
    m.insert(
        BALANCES,
        2,
        "Balances",
        "Transfer",
        vec![FieldType::AccountId, FieldType::AccountId, FieldType::U128],
    );
    m
}

struct Harness {
    _dir: tempfile::TempDir,
    meta: EventMetadata,
    chain: Arc<MockChainClient>,
    report: Arc<MockReportClient>,
    workloads: Arc<MockWorkloadManager>,
    forwarder: Arc<MockPortForwarder>,
    runner: Arc<MockDeploymentRunner>,
    agent: ProviderAgent,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(ChainRegistrationState::default()).await
    }

    async fn start_with(initial: ChainRegistrationState) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProviderConfig::default();
        config.identity.peer_id = PEER.to_string();
        config.listener.restart_delay_ms = 0;
        config.state_path = dir.path().join("chain_state.json").display().to_string();
        let store = RegistrationStore::open(&config.state_path).unwrap();
        store.update(|s| *s = initial).unwrap();

        let meta = metadata();
        let chain = Arc::new(MockChainClient::new(meta.clone()));
        let report = Arc::new(MockReportClient::new(7));
        let workloads = Arc::new(MockWorkloadManager::new());
        let forwarder = Arc::new(MockPortForwarder::new());
        let runner = Arc::new(MockDeploymentRunner::new());
        let agent = ProviderAgent::new(
            config,
            Arc::new(store),
            Collaborators {
                chain: chain.clone(),
                report: report.clone(),
                workloads: workloads.clone(),
                forwarder: forwarder.clone(),
                deployments: runner.clone(),
            },
        );
        agent.start().await.unwrap();
        settle().await;
        assert_eq!(agent.listener().state(), ListenerState::Running);

        Self {
            _dir: dir,
            meta,
            chain,
            report,
            workloads,
            forwarder,
            runner,
            agent,
        }
    }

    async fn deliver<E: Encode>(&self, kind: EventKind, event: &E) {
        let (pallet, index) = self.meta.index_of(kind).unwrap();
        let raw = EventRecordsBuilder::new().push(pallet, index, event).build();
        self.deliver_raw(raw).await;
    }

    async fn deliver_raw(&self, raw: Vec<u8>) {
        assert!(self.chain.emit(StorageChangeSet {
            block: [0x11; 32],
            changes: vec![StorageChange {
                key: StorageKey::system_events(),
                data: Some(raw),
            }],
        }));
        settle().await;
    }

    fn state(&self) -> ChainRegistrationState {
        self.agent.store().snapshot()
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn order_created(resource_index: u64, order_index: u64) -> OrderCreated {
    OrderCreated {
        account: [0x5a; 32],
        order_index,
        resource_index,
        duration: 1,
        deploy_type: 2,
        public_key: "pk1".to_string(),
    }
}

fn order_executed(order_index: u64, agreement_index: u64) -> OrderExecuted {
    OrderExecuted {
        account: [0x5a; 32],
        order_index,
        resource_index: 7,
        agreement_index,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// A. ORDER CREATED / WITHDRAWN
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_order_created_emits_create_and_persists() {
    let h = Harness::start().await;
    h.deliver(EventKind::OrderCreated, &order_created(7, 42)).await;

    assert_eq!(h.state().order_index, 42);
    let creates = h.workloads.requests_tagged(LifecycleTag::Create);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].order_no, 42);
    assert_eq!(creates[0].public_key, "pk1");
    assert_eq!(creates[0].deploy_type, 2);

    // the record survives a reopen
    let reopened = RegistrationStore::open(h.agent.config().state_path.clone()).unwrap();
    assert_eq!(reopened.snapshot().order_index, 42);
    h.agent.shutdown().await;
}

#[tokio::test]
async fn test_order_for_other_resource_changes_nothing() {
    let h = Harness::start().await;
    let before = h.state();
    h.deliver(EventKind::OrderCreated, &order_created(8, 42)).await;

    assert_eq!(h.state(), before);
    assert!(h.workloads.requests().is_empty());
    h.agent.shutdown().await;
}

#[tokio::test]
async fn test_withdrawal_emits_destroy() {
    let h = Harness::start_with(ChainRegistrationState {
        resource_index: 7,
        order_index: 42,
        ..Default::default()
    })
    .await;
    h.deliver(
        EventKind::OrderWithdrawn,
        &OrderWithdrawn {
            account: [1; 32],
            order_index: 42,
        },
    )
    .await;

    let destroys = h.workloads.requests_tagged(LifecycleTag::Destroy);
    assert_eq!(destroys.len(), 1);
    assert_eq!(destroys[0].order_no, 42);

    h.deliver(
        EventKind::OrderWithdrawn,
        &OrderWithdrawn {
            account: [1; 32],
            order_index: 41,
        },
    )
    .await;
    assert_eq!(h.workloads.requests_tagged(LifecycleTag::Destroy).len(), 1);
    h.agent.shutdown().await;
}

#[tokio::test]
async fn test_unrelated_events_in_same_block_are_skipped() {
    let h = Harness::start().await;
    let (pallet, index) = h.meta.index_of(EventKind::OrderCreated).unwrap();
    let mut transfer = Vec::new();
    [1u8; 32].encode_to(&mut transfer);
    [2u8; 32].encode_to(&mut transfer);
    1_000_000u128.encode_to(&mut transfer);

    let mut builder = EventRecordsBuilder::new();
    builder.push_raw(BALANCES, 2, &transfer);
    let raw = builder.push(pallet, index, &order_created(7, 42)).build();
    h.deliver_raw(raw).await;

    assert_eq!(h.workloads.requests_tagged(LifecycleTag::Create).len(), 1);
    h.agent.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════════════
// B. AGREEMENT TIMERS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_executed_agreement_heartbeats_then_expires() {
    let h = Harness::start().await;
    h.report.set_overdue(Ok(400_000));
    h.deliver(EventKind::OrderCreated, &order_created(7, 42)).await;
    h.deliver(EventKind::OrderExecuted, &order_executed(42, 3)).await;

    assert_eq!(h.state().agreement_index, 3);
    assert!(h.forwarder.is_listening(SHELL));
    assert!(h.agent.timers().is_registered(3, TimerKind::Heartbeat));

    for _ in 0..2 {
        tokio::time::advance(Duration::from_secs(175)).await;
        settle().await;
    }
    assert_eq!(h.report.heartbeats(), vec![3, 3]);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;

    assert!(!h.workloads.is_live("order-42"));
    assert!(!h.forwarder.is_listening(SHELL));
    assert_eq!(h.report.count(|c| *c == ReportCall::ChangeStatus(7)), 1);
    let s = h.state();
    assert_eq!((s.order_index, s.agreement_index, s.renew_order_index), (0, 0, 0));
    assert!(h.agent.timers().agreements().is_empty());

    // no more heartbeats after teardown
    tokio::time::advance(Duration::from_secs(1_000)).await;
    settle().await;
    assert_eq!(h.report.heartbeats().len(), 2);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_order_is_torn_down_immediately() {
    let h = Harness::start().await;
    h.report.set_overdue(Ok(-1));
    h.deliver(EventKind::OrderCreated, &order_created(7, 42)).await;
    h.deliver(EventKind::OrderExecuted, &order_executed(42, 3)).await;

    assert_eq!(h.state().agreement_index, 0);
    assert!(!h.workloads.is_live("order-42"));
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_after_execution_stops_timers() {
    let h = Harness::start().await;
    h.deliver(EventKind::OrderCreated, &order_created(7, 42)).await;
    h.deliver(EventKind::OrderExecuted, &order_executed(42, 3)).await;
    h.deliver(
        EventKind::AgreementCancelled,
        &AgreementCancelled {
            account: [1; 32],
            agreement_index: 3,
            order_index: 42,
        },
    )
    .await;

    assert_eq!(h.workloads.requests_tagged(LifecycleTag::Destroy).len(), 1);
    assert!(h.agent.timers().agreements().is_empty());
    assert!(!h.forwarder.is_listening(SHELL));
    assert_eq!(h.state().agreement_index, 0);

    tokio::time::advance(Duration::from_secs(7_200)).await;
    settle().await;
    assert!(h.report.heartbeats().is_empty());
    assert_eq!(h.report.count(|c| matches!(c, ReportCall::ChangeStatus(_))), 0);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timers_survive_subscription_restart() {
    let h = Harness::start().await;
    h.deliver(EventKind::OrderCreated, &order_created(7, 42)).await;
    h.deliver(EventKind::OrderExecuted, &order_executed(42, 3)).await;

    h.chain.close_subscription();
    settle().await;
    assert_eq!(h.agent.listener().worker_starts(), 2);

    tokio::time::advance(Duration::from_secs(175)).await;
    settle().await;
    assert_eq!(h.report.heartbeats(), vec![3]);
    h.agent.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════════════
// C. DIRECT DEPLOYMENTS
// ════════════════════════════════════════════════════════════════════════════

fn deployment_requested(peer_id: &str) -> DeploymentRequested {
    DeploymentRequested {
        peer_id: peer_id.to_string(),
        cpu: 1,
        memory: 2,
        start_method: 1,
        command: "-d nginx".to_string(),
        dapp_index: 77,
    }
}

#[tokio::test]
async fn test_deployment_for_other_peer_has_zero_effects() {
    let h = Harness::start().await;
    let before = h.state();
    let report_calls = h.report.calls().len();
    h.deliver(EventKind::DeploymentRequested, &deployment_requested("12D3KooWSomeoneElse"))
        .await;

    assert!(h.runner.calls().is_empty());
    assert!(h.workloads.calls().is_empty());
    assert_eq!(h.report.calls().len(), report_calls);
    assert_eq!(h.state(), before);
    h.agent.shutdown().await;
}

#[tokio::test]
async fn test_deployment_started_and_stopped() {
    let h = Harness::start().await;
    h.deliver(EventKind::DeploymentRequested, &deployment_requested(PEER)).await;
    assert_eq!(h.agent.deployments().active_indices(), vec![77]);

    h.deliver(
        EventKind::DeploymentStopped,
        &DeploymentStopped {
            peer_id: PEER.to_string(),
            dapp_index: 77,
        },
    )
    .await;
    assert!(h.agent.deployments().active_indices().is_empty());
    assert_eq!(h.runner.calls().len(), 2);
    h.agent.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════════════
// D. PERSISTENCE AND AGENT RESTARTS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_renew_request_is_bare() {
    let h = Harness::start_with(ChainRegistrationState {
        resource_index: 7,
        order_index: 42,
        ..Default::default()
    })
    .await;
    h.deliver(
        EventKind::OrderRenewed,
        &chainlease_provider::events::OrderRenewed {
            account: [1; 32],
            order_index: 43,
            resource_index: 7,
            agreement_index: 0,
        },
    )
    .await;

    assert_eq!(
        h.workloads.requests_tagged(LifecycleTag::Renew),
        vec![LifecycleRequest::bare(LifecycleTag::Renew, 43)]
    );
    let reopened = RegistrationStore::open(h.agent.config().state_path.clone()).unwrap();
    assert_eq!(reopened.snapshot().renew_order_index, 43);
    h.agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_live_agreement_resumes_after_restart() {
    let h = Harness::start_with(ChainRegistrationState {
        resource_index: 7,
        order_index: 42,
        agreement_index: 3,
        ..Default::default()
    })
    .await;

    assert!(h.forwarder.is_listening(SHELL));
    assert!(h.agent.timers().is_registered(3, TimerKind::Heartbeat));
    assert!(h.agent.timers().is_registered(3, TimerKind::Expiration));

    tokio::time::advance(Duration::from_secs(175)).await;
    settle().await;
    assert_eq!(h.report.heartbeats(), vec![3]);
    h.agent.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_during_activation_rearms_on_restart() {
    let h = Harness::start().await;
    h.deliver(EventKind::OrderCreated, &order_created(7, 42)).await;

    let gate = h.forwarder.hold_next_listen();
    h.deliver(EventKind::OrderExecuted, &order_executed(42, 3)).await;
    assert_eq!(h.state().agreement_index, 3);
    assert!(!h.agent.timers().is_registered(3, TimerKind::Expiration));

    // shutdown lets the parked activation finish before the worker exits
    tokio::join!(h.agent.shutdown(), async {
        settle().await;
        gate.notify_one();
    });
    assert_eq!(h.agent.listener().state(), ListenerState::Stopped);
    assert!(h.forwarder.is_listening(SHELL));
    assert_eq!(h.report.count(|c| *c == ReportCall::Overdue(42)), 1);
    assert_eq!(h.state().agreement_index, 3);

    h.agent.start().await.unwrap();
    settle().await;
    assert!(h.agent.timers().is_registered(3, TimerKind::Heartbeat));
    assert!(h.agent.timers().is_registered(3, TimerKind::Expiration));

    // redelivery after resumption is a duplicate
    h.deliver(EventKind::OrderExecuted, &order_executed(42, 3)).await;
    assert_eq!(h.report.count(|c| *c == ReportCall::Overdue(42)), 2);
    h.agent.shutdown().await;
}
