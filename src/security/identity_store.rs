//! Allow-list of trusted display identities.
//!
//! The active set lives behind `RwLock<Arc<TrustedIdentitySet>>`. Readers
//! clone the `Arc` and keep a complete, immutable snapshot; writers build a
//! new set, persist it, and only then swap the pointer. Writers are
//! serialized by a separate mutex so a slow persist never blocks readers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::storage::{SecureStorage, StorageError};
use crate::config::{FallbackPolicy, IdentityConfig};
use crate::display::DisplayIdentity;

/// Identity trusted when storage is unreadable under the placeholder policy.
pub const PLACEHOLDER_IDENTITY: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrustedIdentitySet {
    version: u64,
    identities: BTreeSet<DisplayIdentity>,
}

impl TrustedIdentitySet {
    pub fn new(version: u64, identities: impl IntoIterator<Item = DisplayIdentity>) -> Self {
        Self {
            version,
            identities: identities.into_iter().collect(),
        }
    }

    /// Fallback set for `policy` (always version 0).
    pub fn fallback(policy: FallbackPolicy) -> Self {
        match policy {
            FallbackPolicy::Placeholder => {
                Self::new(0, DisplayIdentity::parse(PLACEHOLDER_IDENTITY))
            }
            FallbackPolicy::FailClosed => Self::default(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, identity: &DisplayIdentity) -> bool {
        self.identities.contains(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplayIdentity> {
        self.identities.iter()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    /// Storage could not be read; `fallback` is now the active set.
    #[error("identity store unavailable: {reason}")]
    StoreUnavailable {
        reason: String,
        fallback: Arc<TrustedIdentitySet>,
    },

    /// The new set was not durably written; the previous set is still active.
    #[error("failed to persist trusted identity set: {0}")]
    PersistFailed(#[source] StorageError),

    #[error("failed to encode trusted identity set: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub struct IdentityStore {
    storage: Arc<dyn SecureStorage>,
    key: String,
    seed: Vec<DisplayIdentity>,
    fallback: FallbackPolicy,
    active: RwLock<Arc<TrustedIdentitySet>>,
    writer: Mutex<()>,
}

impl IdentityStore {
    /// Create a store. Nothing is trusted until [`load`](Self::load) runs.
    pub fn new(storage: Arc<dyn SecureStorage>, config: &IdentityConfig) -> Self {
        let seed = config
            .trusted
            .iter()
            .filter_map(|raw| {
                let parsed = DisplayIdentity::parse(raw);
                if parsed.is_none() {
                    warn!("Ignoring blank trusted identity in config");
                }
                parsed
            })
            .collect();

        Self {
            storage,
            key: config.storage_key.clone(),
            seed,
            fallback: config.fallback,
            active: RwLock::new(Arc::new(TrustedIdentitySet::default())),
            writer: Mutex::new(()),
        }
    }

    /// Read the persisted set and make it active.
    ///
    /// Nothing persisted yet is not an error: the config seed becomes
    /// version 0. Unreadable or corrupt storage activates the fallback set
    /// and reports [`IdentityStoreError::StoreUnavailable`].
    pub fn load(&self) -> Result<Arc<TrustedIdentitySet>, IdentityStoreError> {
        let _writer = self.lock_writer();

        let loaded = match self.storage.load(&self.key) {
            Ok(Some(bytes)) => serde_json::from_slice::<TrustedIdentitySet>(&bytes)
                .map_err(|e| format!("stored identity set is corrupt: {}", e)),
            Ok(None) => {
                debug!("No stored identity set, seeding {} from config", self.seed.len());
                Ok(TrustedIdentitySet::new(0, self.seed.iter().cloned()))
            }
            Err(e) => Err(e.to_string()),
        };

        match loaded {
            Ok(set) => {
                let set = Arc::new(set);
                self.swap(set.clone());
                info!(
                    "Loaded trusted identity set v{} ({} identities)",
                    set.version(),
                    set.len()
                );
                Ok(set)
            }
            Err(reason) => {
                let fallback = Arc::new(TrustedIdentitySet::fallback(self.fallback));
                self.swap(fallback.clone());
                warn!(
                    "Identity store unavailable ({}); {} fallback in force",
                    reason, self.fallback
                );
                Err(IdentityStoreError::StoreUnavailable { reason, fallback })
            }
        }
    }

    /// Persist `identities` as the next version and make it active.
    ///
    /// All-or-nothing: if the write fails the previous set stays active.
    pub fn replace(
        &self,
        identities: impl IntoIterator<Item = DisplayIdentity>,
    ) -> Result<Arc<TrustedIdentitySet>, IdentityStoreError> {
        let _writer = self.lock_writer();

        let next = TrustedIdentitySet::new(self.current().version() + 1, identities);
        let bytes = serde_json::to_vec(&next)?;
        self.storage
            .save(&self.key, &bytes)
            .map_err(IdentityStoreError::PersistFailed)?;

        let next = Arc::new(next);
        self.swap(next.clone());
        info!(
            "Trusted identity set replaced: v{} ({} identities)",
            next.version(),
            next.len()
        );
        Ok(next)
    }

    /// Snapshot of the active set.
    pub fn current(&self) -> Arc<TrustedIdentitySet> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn contains(&self, identity: &DisplayIdentity) -> bool {
        self.current().contains(identity)
    }

    fn swap(&self, set: Arc<TrustedIdentitySet>) {
        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = set;
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
