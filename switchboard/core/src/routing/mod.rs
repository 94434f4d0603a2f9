//! Multi-Provider Routing
//!
//! Everything between "a request arrived" and "a provider answered".
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |      Router      |  <-- execute / reload / provider_status
//! +--------+---------+
//!          |  Arc<ConfigSnapshot> captured once per request
//!          v
//! +------------------+     +-------------------+
//! | PerformanceScorer| --> | ranked providers  |
//! +------------------+     +---------+---------+
//!                                    |
//!          +-------------------------+-------------------------+
//!          v                         v                         v
//! +------------------+     +------------------+     +--------------------+
//! |  CredentialPool  |     |  HealthMonitor   |     |  ProviderAdapter   |
//! | quota / LRU pick |     | circuit breakers |     | vendor call        |
//! +------------------+     +------------------+     +--------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Explicit ownership**: the [`Router`] owns all state; nothing is global
//! 2. **Flat keys**: breakers and quotas are addressed by ids, never pointers
//! 3. **Classified failures**: fallback is driven by [`ErrorClass`](crate::error::ErrorClass) values
//! 4. **Snapshot isolation**: reloads never affect requests already running

pub mod adapter;
pub mod credentials;
pub mod events;
pub mod health;
pub mod metrics;
pub mod router;
pub mod scorer;
pub mod snapshot;

pub use adapter::{AdapterRegistry, ProviderAdapter, ProviderResponse, RouteRequest, RoutedResponse};
pub use credentials::{CredentialHandle, CredentialPool, CredentialStatus, QuotaStatus};
pub use events::{AttemptOutcome, CircuitTransition, EventSink, RouterEvent, RoutingDecision};
pub use health::{Admission, BreakerStatus, CircuitBreaker, CircuitState, HealthKey, HealthMonitor};
pub use metrics::{MetricsSummary, ProviderMetricsSummary, RouterMetrics};
pub use router::{CircuitStatus, ProviderStatus, Router, RouterBuilder};
pub use scorer::{PerformanceScorer, ProviderStats, RankedProvider};
pub use snapshot::{ConfigSnapshot, SnapshotStore};
