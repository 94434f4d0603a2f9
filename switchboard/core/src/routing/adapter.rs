//! Provider Adapter Seam
//!
//! The router never speaks a vendor protocol. Each provider is reached
//! through a [`ProviderAdapter`] that turns a payload, a credential and a
//! model id into either a response or a classified [`AdapterError`].
//!
//! Adapters are registered by name in an [`AdapterRegistry`] built at
//! startup; a provider's `adapter` key (defaulting to its id) selects one.
//! The registry is fixed for the router's lifetime, so a reload can only
//! reference adapters that already exist.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::credentials::CredentialHandle;
use crate::config::Capability;
use crate::error::AdapterError;

// ============================================================================
// Request / Response
// ============================================================================

/// A request to route
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Correlation id carried through logs and events
    pub id: Uuid,

    /// What kind of model is needed
    pub capability: Capability,

    /// Opaque payload handed to the adapter unchanged
    pub payload: serde_json::Value,

    /// Model id to try first within each provider
    #[serde(default)]
    pub preferred_model: Option<String>,

    /// Per-call timeout overriding the provider's
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl RouteRequest {
    /// Create a request with a fresh id
    pub fn new(capability: Capability, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            capability,
            payload,
            preferred_model: None,
            timeout: None,
        }
    }

    /// Prefer a model id
    #[must_use]
    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_model = Some(model.into());
        self
    }

    /// Override the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What an adapter returns on success
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider output
    pub payload: serde_json::Value,

    /// Actual cost if the provider reported one
    #[serde(default)]
    pub cost: Option<f64>,
}

impl ProviderResponse {
    /// Response without a reported cost
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            cost: None,
        }
    }

    /// Attach a reported cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// A routed response with where it came from
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutedResponse {
    /// Provider output
    pub payload: serde_json::Value,
    /// Provider that served the request
    pub provider: String,
    /// Credential id used
    pub credential: String,
    /// Model that served the request
    pub model: String,
    /// Calls made, including the successful one
    pub attempts: u32,
    /// Latency of the successful call
    pub latency: Duration,
    /// Snapshot version the request was routed against
    pub snapshot_version: u64,
}

// ============================================================================
// Adapter Trait
// ============================================================================

/// One vendor protocol
///
/// Implementations must classify every failure; the router decides what to
/// do next purely from the [`ErrorClass`](crate::error::ErrorClass).
/// The router applies the timeout, so adapters need not.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Perform one call
    async fn call(
        &self,
        credential: &CredentialHandle,
        model: &str,
        request: &RouteRequest,
    ) -> Result<ProviderResponse, AdapterError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Adapters by registration key
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `key`, replacing any previous one
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(key, adapter);
        self
    }

    /// Register an adapter under `key`, replacing any previous one
    pub fn register(&mut self, key: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(key.into(), adapter);
    }

    /// Look up an adapter
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(key).cloned()
    }

    /// Whether `key` is registered
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.adapters.contains_key(key)
    }

    /// Registered keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.keys())
            .finish()
    }
}
