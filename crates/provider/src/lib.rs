//! # Chainlease Provider Agent
//!
//! Advertises a compute resource on the marketplace chain, watches the
//! chain's event log for orders placed against it, and drives the local
//! lifecycle of the rented workload.
//!
//! # Architecture
//!
//! ```text
//!  RegistrationController ──register──► ChainListener (supervisor)
//!                                           │
//!                                           ▼ change sets
//!                                     EventDecoder
//!                                           │ Vec<ChainEvent>
//!                                           ▼
//!                                    OrderDispatcher
//!                       ┌───────────────────┼────────────────────┐
//!                       ▼                   ▼                    ▼
//!               WorkloadManager     AgreementLifecycle   DeploymentController
//!               (create / renew /     │ heartbeat                │
//!                destroy)             │ expiration               ▼
//!                                     ▼                   DeploymentRunner
//!                               TimerRegistry             (docker / compose)
//! ```
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | `chain` | `ChainClient` contract, storage change sets, mock client |
//! | `events` | SCALE event records, metadata, `EventDecoder` |
//! | `dispatcher` | matching rules from events to lifecycle effects |
//! | `agreement` | heartbeat, expiration and teardown of agreements |
//! | `timers` | per-agreement cancellable timers |
//! | `registration` | resource (de)registration |
//! | `listener` | supervised subscription loop |
//! | `workload` | `LifecycleRequest` and the workload manager boundary |
//! | `report` | heartbeat/status/overdue calls to the chain |
//! | `forwarding` | peer-network port forwarding boundary |
//! | `deployment` | direct (marketplace-initiated) deployments |
//! | `bundle_fetcher` | compose bundle download from IPFS |
//! | `agent` | wiring |
//!
//! # Persisted State
//!
//! The registration record lives in [`chainlease_common::RegistrationStore`].
//! Every read-modify-write goes through the store, so the dispatcher and the
//! expiration timers never lose each other's updates.

pub mod agent;
pub mod agreement;
pub mod bundle_fetcher;
pub mod chain;
pub mod deployment;
pub mod dispatcher;
pub mod events;
pub mod forwarding;
pub mod listener;
pub mod registration;
pub mod report;
pub mod timers;
pub mod workload;

pub use agent::{AgentError, Collaborators, ProviderAgent};
pub use agreement::{AgreementLifecycle, ExpiryOutcome, TeardownStep};
pub use bundle_fetcher::{BundleFetcher, IpfsFetcher};
pub use chain::{
    ChainClient, ChainError, MockChainClient, StorageChange, StorageChangeSet,
    StorageChangeStream, StorageKey, SYSTEM_EVENTS_KEY,
};
pub use deployment::{
    Deployment, DeploymentController, DeploymentError, DeploymentRunner, DeploymentSpec,
    DockerRunner, MockDeploymentRunner, StartMethod,
};
pub use dispatcher::{OrderDispatcher, Outcome};
pub use events::{ChainEvent, DecodeError, EventDecoder, EventKind, EventMetadata};
pub use forwarding::{ForwardError, MockPortForwarder, PortForwarder, SSH_PROTOCOL};
pub use listener::{ChainListener, ListenerError, ListenerState};
pub use registration::{RegistrationController, RegistrationError};
pub use report::{MockReportClient, ReportClient, ReportError, ResourceInfo};
pub use timers::{TimerKind, TimerRegistry};
pub use workload::{
    LifecycleRequest, LifecycleTag, MockWorkloadManager, WorkloadError, WorkloadManager,
};
