//! # Chainlease Common Crate
//!
//! Pieces shared by the provider agent and whatever binary embeds it.
//!
//! ## Modules
//! - `config`: TOML node configuration (`ProviderConfig`)
//! - `state`: persisted chain registration record (`RegistrationStore`)
//! - `logging`: tracing subscriber initialisation

pub mod config;
pub mod logging;
pub mod state;

pub use config::{
    ConfigError, IdentityConfig, IpfsConfig, ListenerConfig, LoggingConfig, ProviderConfig,
    VmConfig,
};
pub use logging::init_tracing;
pub use state::{ChainRegistrationState, RegistrationStore, StateError};
