//! Configuration Snapshots
//!
//! A [`ConfigSnapshot`] is an immutable, versioned copy of a validated
//! [`RouterConfig`]. The [`SnapshotStore`] hands out `Arc`s to the current
//! snapshot with a lock-free load; a reload builds a complete new snapshot
//! and swaps the pointer. Requests that captured the old `Arc` keep it until
//! they finish.
//!
//! ```text
//!   reload(config) ──> validate ──> ConfigSnapshot{v+1} ──> swap
//!                                                            │
//!   request A ── load() ── Arc<v1> ─────────────── (still v1) │
//!   request B ──────────────────────────── load() ── Arc<v2> ◄┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::{Capability, ConfigError, ProviderConfig, RouterConfig, RoutingPolicy};

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable view of the router configuration
#[derive(Debug)]
pub struct ConfigSnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    config: RouterConfig,
}

impl ConfigSnapshot {
    /// Validate `config` and freeze it as version `version`
    ///
    /// # Errors
    ///
    /// Returns the first validation problem; nothing is built in that case.
    pub fn build(
        config: RouterConfig,
        version: u64,
        loaded_at: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            version,
            loaded_at,
            config,
        })
    }

    /// Monotonic version number, starting at 1
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this snapshot was installed
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Routing policy
    #[must_use]
    pub fn policy(&self) -> &RoutingPolicy {
        &self.config.policy
    }

    /// The configuration this snapshot was built from
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// All providers in declared order
    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.config.providers.iter()
    }

    /// Look up a provider by id
    #[must_use]
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.config.providers.iter().find(|p| p.id == id)
    }

    /// Declared position of a provider, used as the ranking tie-breaker
    #[must_use]
    pub fn priority(&self, id: &str) -> Option<usize> {
        self.config.providers.iter().position(|p| p.id == id)
    }

    /// Enabled providers with at least one model serving `capability`, in declared order
    #[must_use]
    pub fn eligible_providers(&self, capability: Capability) -> Vec<&ProviderConfig> {
        self.config
            .providers
            .iter()
            .filter(|p| p.enabled && p.models.iter().any(|m| m.supports(capability)))
            .collect()
    }

    /// Every `(provider, credential)` pair declared in this snapshot
    #[must_use]
    pub fn credential_keys(&self) -> HashSet<(String, String)> {
        self.config
            .providers
            .iter()
            .flat_map(|p| {
                p.credentials
                    .iter()
                    .map(move |c| (p.id.clone(), c.id.clone()))
            })
            .collect()
    }

    /// Every declared provider id
    #[must_use]
    pub fn provider_ids(&self) -> HashSet<String> {
        self.config.providers.iter().map(|p| p.id.clone()).collect()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Single-writer, multi-reader holder of the current snapshot
#[derive(Debug)]
pub struct SnapshotStore {
    current: ArcSwap<ConfigSnapshot>,
    reload_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Create a store around an initial snapshot
    #[must_use]
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            reload_lock: Mutex::new(()),
        }
    }

    /// Current snapshot (lock-free)
    #[must_use]
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Validate and install a new configuration
    ///
    /// `check` runs after structural validation and may reject the
    /// configuration for reasons only the caller knows (e.g. missing
    /// adapters). Reloads are serialized; on any error the active snapshot
    /// is left untouched.
    ///
    /// # Errors
    ///
    /// Returns the validation or `check` error.
    pub fn replace<F>(
        &self,
        config: RouterConfig,
        loaded_at: DateTime<Utc>,
        check: F,
    ) -> Result<Arc<ConfigSnapshot>, ConfigError>
    where
        F: FnOnce(&RouterConfig) -> Result<(), ConfigError>,
    {
        let _guard = self.reload_lock.lock();

        config.validate()?;
        check(&config)?;

        let version = self.current.load().version + 1;
        let snapshot = Arc::new(ConfigSnapshot::build(config, version, loaded_at)?);
        self.current.store(Arc::clone(&snapshot));
        Ok(snapshot)
    }
}
