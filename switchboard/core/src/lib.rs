//! Switchboard Core - Multi-Provider Request Routing
//!
//! Routes generation requests across several AI provider backends, each
//! with several credentials and models, choosing a target by measured
//! performance and falling back transparently on failure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │          Callers (HTTP layer, dashboards, CLIs)               │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!        execute / execute_with_cancel     provider_status / reload
//!                 │                              │
//! ┌───────────────┴──────────────────────────────┴───────────────┐
//! │                          Router                               │
//! │  ┌────────────┐ ┌─────────────┐ ┌────────────┐ ┌───────────┐ │
//! │  │ Credential │ │   Health    │ │Performance │ │  Config   │ │
//! │  │    Pool    │ │   Monitor   │ │   Scorer   │ │ Snapshot  │ │
//! │  └────────────┘ └─────────────┘ └────────────┘ └───────────┘ │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ ProviderAdapter::call
//!                    ┌────────────┼────────────┐
//!                    v            v            v
//!                vendor A     vendor B     vendor C
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: owns all routing state and the current configuration snapshot
//! - [`ProviderAdapter`]: the one seam to vendor protocols
//! - [`RouterConfig`]: serde configuration, loadable from TOML
//! - [`RouterError`]: what callers see when a request cannot be served
//! - [`RouterEvent`]: decisions and circuit transitions for observers
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{load_config_from_path, Capability, RouteRequest, Router};
//!
//! let config = load_config_from_path("router.toml".as_ref())?;
//! let router = Arc::new(
//!     Router::builder(config)
//!         .adapter("vendor-a", Arc::new(MyVendorAdapter::new()))
//!         .build()?,
//! );
//!
//! let response = router
//!     .execute(RouteRequest::new(Capability::Text, serde_json::json!({"prompt": "hi"})))
//!     .await?;
//! println!("served by {}/{}", response.provider, response.model);
//! ```
//!
//! # Module Overview
//!
//! - [`clock`]: wall-clock abstraction for quota windows and breaker timing
//! - [`config`]: configuration types, validation and TOML loading
//! - [`error`]: failure taxonomy and the aggregate router error
//! - [`routing`]: credential pool, health monitor, scorer, snapshots and the router

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod clock;
pub mod config;
pub mod error;
pub mod routing;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    apply_env_overrides, default_config_path, load_config_from_path, Capability, ConfigError,
    CredentialConfig, HealthPolicy, ModelConfig, ProviderConfig, QuotaLimits, RouterConfig,
    RoutingPolicy, ScoringPolicy,
};
pub use error::{
    AdapterError, AttemptRecord, ErrorClass, RouterError, SkipReason, SkippedCandidate,
};

// Routing exports
pub use routing::{
    AdapterRegistry, CircuitState, ConfigSnapshot, CredentialHandle, HealthKey, MetricsSummary,
    ProviderAdapter, ProviderResponse, ProviderStatus, RouteRequest, RoutedResponse, Router,
    RouterBuilder, RouterEvent, RoutingDecision,
};
