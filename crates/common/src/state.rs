//! # Chain Registration State
//!
//! [`RegistrationStore`] owns the persisted [`ChainRegistrationState`]: the
//! chain-assigned resource index and the order/agreement currently bound to it.
//!
//! ## Single Writer
//!
//! The listener's dispatcher and the per-agreement expiration timers both
//! read-modify-write this record from different tasks. Every mutation goes
//! through [`RegistrationStore::update`] (or one of the guarded helpers built on
//! it), which holds the lock across read, modify and persist. Updates are
//! therefore serialized and none can be lost.
//!
//! ## Persistence
//!
//! The record is stored as JSON and written with write-to-tmp + fsync +
//! rename. If persisting fails the in-memory record is left untouched and the
//! error is returned to the caller.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Registration record persisted across restarts.
///
/// An index of zero means "none": no order taken, no live agreement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainRegistrationState {
    pub resource_index: u64,
    pub order_index: u64,
    pub agreement_index: u64,
    pub renew_order_index: u64,
    /// Renter account, `0x`-prefixed hex.
    pub account_address: String,
    pub deploy_type: u32,
}

impl ChainRegistrationState {
    /// True when an agreement is currently bound to the resource.
    pub fn has_live_agreement(&self) -> bool {
        self.agreement_index != 0
    }
}

/// Thread-safe, optionally file-backed holder of [`ChainRegistrationState`].
#[derive(Debug)]
pub struct RegistrationStore {
    /// `None` for in-memory stores.
    path: Option<PathBuf>,
    state: Mutex<ChainRegistrationState>,
}

impl RegistrationStore {
    /// Open a file-backed store. A missing file starts from the default state;
    /// an unreadable or corrupted file is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = Self::load_from_file(&path)?;
        debug!(path = %path.display(), ?state, "registration state loaded");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory(initial: ChainRegistrationState) -> Self {
        Self {
            path: None,
            state: Mutex::new(initial),
        }
    }

    fn load_from_file(path: &Path) -> Result<ChainRegistrationState, StateError> {
        if !path.exists() {
            return Ok(ChainRegistrationState::default());
        }
        let data = fs::read(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&data).map_err(|source| StateError::Corrupted {
            path: path.to_path_buf(),
            source,
        })
    }

    fn persist(&self, state: &ChainRegistrationState) -> Result<(), StateError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(state)?;
        let io_err = |source| StateError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&data).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp_path, path).map_err(io_err)?;
        Ok(())
    }

    /// Clone of the current record.
    pub fn snapshot(&self) -> ChainRegistrationState {
        self.state.lock().clone()
    }

    /// Apply `f` to a copy of the record and persist it; the new record is
    /// installed only if persisting succeeds. Returns whatever `f` returns.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut ChainRegistrationState) -> R,
    ) -> Result<R, StateError> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        let out = f(&mut next);
        if next != *guard {
            self.persist(&next)?;
            *guard = next;
        }
        Ok(out)
    }

    /// Replace the record with `new` only if it currently equals `expected`.
    pub fn compare_and_swap(
        &self,
        expected: &ChainRegistrationState,
        new: ChainRegistrationState,
    ) -> Result<bool, StateError> {
        let mut guard = self.state.lock();
        if *guard != *expected {
            return Ok(false);
        }
        self.persist(&new)?;
        *guard = new;
        Ok(true)
    }

    /// Zero the order, agreement and renewal indices if `agreement_index` is
    /// still the live agreement. Returns false when another agreement (or none)
    /// is live, in which case nothing changes.
    pub fn reset_agreement(&self, agreement_index: u64) -> Result<bool, StateError> {
        self.update(|s| {
            if agreement_index == 0 || s.agreement_index != agreement_index {
                return false;
            }
            s.order_index = 0;
            s.agreement_index = 0;
            s.renew_order_index = 0;
            true
        })
    }
}
