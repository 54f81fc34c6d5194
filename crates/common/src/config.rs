//! Node configuration loader using TOML and serde.
//!
//! Every field has a default so a partial file is accepted; `validate()`
//! rejects configurations the agent cannot run with.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Heartbeat period used when the config does not override it.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 175;

/// Delay before a failed subscription worker is started again.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Peer identity of this agent on the overlay network.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    pub peer_id: String,
}

/// Resources this node offers and the image used for rentals.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct VmConfig {
    pub cpu: u64,
    pub mem: u64,
    pub disk: u64,
    pub system: String,
    pub image: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            cpu: 1,
            mem: 1,
            disk: 50,
            system: "ubuntu".to_string(),
            image: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Seconds between liveness reports for an active agreement.
    pub heartbeat_interval_secs: u64,
    /// Milliseconds to wait before restarting a failed worker. 0 restarts immediately.
    pub restart_delay_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IpfsConfig {
    pub api_url: String,
    /// Directory compose bundles are downloaded into.
    pub bundle_dir: String,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        IpfsConfig {
            api_url: "http://localhost:5001".to_string(),
            bundle_dir: "./tmp".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub identity: IdentityConfig,
    pub public_ip: String,
    pub vm: VmConfig,
    pub api_port: u16,
    pub listener: ListenerConfig,
    /// JSON file holding the persisted chain registration state.
    pub state_path: String,
    pub ipfs: IpfsConfig,
    pub logging: LoggingConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            identity: IdentityConfig::default(),
            public_ip: "127.0.0.1".to_string(),
            vm: VmConfig::default(),
            api_port: 10771,
            listener: ListenerConfig::default(),
            state_path: "./data/chain_state.json".to_string(),
            ipfs: IpfsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.peer_id.trim().is_empty() {
            return Err(ConfigError::Invalid("identity.peer_id cannot be empty".to_string()));
        }
        if self.vm.cpu == 0 || self.vm.mem == 0 {
            return Err(ConfigError::Invalid("vm.cpu and vm.mem must be positive".to_string()));
        }
        // chain side stores both as u8
        if self.vm.cpu > u8::MAX as u64 || self.vm.mem > u8::MAX as u64 {
            return Err(ConfigError::Invalid("vm.cpu and vm.mem must fit in a byte".to_string()));
        }
        if self.api_port == u16::MAX {
            return Err(ConfigError::Invalid("api_port leaves no room for the shell port".to_string()));
        }
        if self.listener.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "listener.heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.state_path.is_empty() {
            return Err(ConfigError::Invalid("state_path cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Parse a config from TOML text.
pub fn from_toml_str(s: &str) -> Result<ProviderConfig, ConfigError> {
    Ok(toml::from_str(s)?)
}

/// Load config from a TOML file path.
/// If file is missing or parse fails, an error is returned.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<ProviderConfig, ConfigError> {
    let p = path.as_ref();
    let s = fs::read_to_string(p).map_err(|source| ConfigError::Io {
        path: p.to_path_buf(),
        source,
    })?;
    from_toml_str(&s)
}
