//! Routing Engine
//!
//! The [`Router`] owns every piece of mutable routing state (credential
//! quotas, circuit breakers, performance windows, metrics) plus the current
//! configuration snapshot, and exposes a single entry point:
//! [`Router::execute`].
//!
//! # Fallback Order
//!
//! ```text
//! rank providers ──> provider P1 ──> model M1 ──> credential C1 ──> call
//!                                              └─> credential C2 ──> call
//!                               └─> model M2 ──> credential C1 ──> call
//!                ──> provider P2 ──> ...
//! ```
//!
//! Within the ranked provider list, each provider's capable models are tried
//! in declared order (a preferred model first), and for each model every
//! usable credential in least-recently-used order. A candidate is skipped
//! without a call when no credential has quota or its circuit is open.
//! The walk stops at the first success, at a content rejection, or after
//! `max_attempts` calls.
//!
//! # Snapshot Isolation
//!
//! A request captures the snapshot once, before ranking, and reads provider
//! definitions and policy only from it. A concurrent [`Router::reload`]
//! changes what the *next* request sees.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::adapter::{AdapterRegistry, ProviderAdapter, RouteRequest, RoutedResponse};
use super::credentials::{CredentialPool, CredentialStatus};
use super::events::{AttemptOutcome, EventSink, RouterEvent, RoutingDecision, DEFAULT_EVENT_CAPACITY};
use super::health::{BreakerStatus, HealthKey, HealthMonitor};
use super::metrics::{MetricsSummary, RouterMetrics};
use super::scorer::{PerformanceScorer, ProviderStats};
use super::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{Capability, ConfigError, HealthPolicy, ModelConfig, ProviderConfig, RouterConfig};
use crate::error::{
    AdapterError, AttemptRecord, ErrorClass, RouterError, SkipReason, SkippedCandidate,
};

// ============================================================================
// Status Types
// ============================================================================

/// Circuit state of one (credential, model) pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    /// Credential id
    pub credential: String,
    /// Model id
    pub model: String,
    /// Breaker details
    #[serde(flatten)]
    pub breaker: BreakerStatus,
}

/// Everything the router knows about one provider
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProviderStatus {
    /// Provider id
    pub id: String,
    /// Whether the provider takes traffic
    pub enabled: bool,
    /// Snapshot this status was read against
    pub snapshot_version: u64,
    /// Current ranking score among enabled providers (`None` when disabled)
    pub score: Option<f64>,
    /// Whether the score is a prior rather than measured
    pub score_is_prior: bool,
    /// Rolling performance statistics
    pub stats: Option<ProviderStats>,
    /// Quota usage per credential
    pub credentials: Vec<CredentialStatus>,
    /// Breakers that have seen traffic
    pub circuits: Vec<CircuitStatus>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Router`]
pub struct RouterBuilder {
    config: RouterConfig,
    adapters: AdapterRegistry,
    clock: Option<Arc<dyn Clock>>,
    event_capacity: usize,
}

impl RouterBuilder {
    /// Register an adapter under `key`
    #[must_use]
    pub fn adapter(mut self, key: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.register(key, adapter);
        self
    }

    /// Use a prebuilt adapter registry
    #[must_use]
    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Read time from `clock` instead of the system clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Per-subscriber event buffer
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the configuration and create the router
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid or an
    /// enabled provider has no registered adapter.
    pub fn build(self) -> Result<Router, ConfigError> {
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        check_adapters(&self.config, &self.adapters)?;
        let snapshot = ConfigSnapshot::build(self.config, 1, clock.now())?;

        tracing::info!(
            providers = snapshot.config().providers.len(),
            enabled = snapshot.config().enabled_count(),
            adapters = ?self.adapters.keys(),
            "Router initialized"
        );

        let events = EventSink::new(self.event_capacity);
        Ok(Router {
            store: SnapshotStore::new(snapshot),
            adapters: self.adapters,
            credentials: CredentialPool::new(Arc::clone(&clock)),
            health: HealthMonitor::new(Arc::clone(&clock), events.clone()),
            scorer: PerformanceScorer::new(),
            metrics: RouterMetrics::new(),
            events,
            clock,
        })
    }
}

fn check_adapters(config: &RouterConfig, adapters: &AdapterRegistry) -> Result<(), ConfigError> {
    for provider in config.providers.iter().filter(|p| p.enabled) {
        if !adapters.contains(provider.adapter_key()) {
            return Err(ConfigError::ValidationError(format!(
                "provider '{}' uses unregistered adapter '{}'",
                provider.id,
                provider.adapter_key()
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Router
// ============================================================================

/// Multi-provider request router
///
/// Construct once and share behind an `Arc`.
#[derive(Debug)]
pub struct Router {
    store: SnapshotStore,
    adapters: AdapterRegistry,
    clock: Arc<dyn Clock>,
    credentials: CredentialPool,
    health: HealthMonitor,
    scorer: PerformanceScorer,
    metrics: RouterMetrics,
    events: EventSink,
}

impl Router {
    /// Start building a router for `config`
    #[must_use]
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder {
            config,
            adapters: AdapterRegistry::new(),
            clock: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Create a router with the system clock
    ///
    /// # Errors
    ///
    /// See [`RouterBuilder::build`].
    pub fn new(config: RouterConfig, adapters: AdapterRegistry) -> Result<Self, ConfigError> {
        Self::builder(config).adapters(adapters).build()
    }

    /// Route a request
    ///
    /// Dropping the returned future cancels the request; a call in flight at
    /// that moment is recorded as a `Cancelled` failure.
    ///
    /// # Errors
    ///
    /// [`RouterError::ContentRejected`] when a provider refuses the content,
    /// [`RouterError::Exhausted`] when no candidate succeeded.
    pub async fn execute(&self, request: RouteRequest) -> Result<RoutedResponse, RouterError> {
        self.run(&request, None).await
    }

    /// Route a request, stopping early when `cancel` fires
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute), plus [`RouterError::Cancelled`].
    pub async fn execute_with_cancel(
        &self,
        request: RouteRequest,
        cancel: CancellationToken,
    ) -> Result<RoutedResponse, RouterError> {
        self.run(&request, Some(&cancel)).await
    }

    async fn run(
        &self,
        request: &RouteRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<RoutedResponse, RouterError> {
        let snapshot = self.store.load();
        let policy = snapshot.policy();

        self.metrics.requests.inc();
        let _in_flight = InFlight::enter(&self.metrics);

        let eligible = snapshot.eligible_providers(request.capability);
        let ids: Vec<&str> = eligible.iter().map(|p| p.id.as_str()).collect();
        let ranking = self.scorer.rank(&ids, &policy.scoring);

        tracing::debug!(
            request_id = %request.id,
            capability = %request.capability,
            snapshot = snapshot.version(),
            ranking = ?ranking.iter().map(|r| r.provider.as_str()).collect::<Vec<_>>(),
            "Routing request"
        );

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut skipped: Vec<SkippedCandidate> = Vec::new();
        // (credential, model) pairs already tried or skipped in this request
        let mut passed: HashSet<HealthKey> = HashSet::new();
        // credentials rejected for authentication, excluded for every model
        let mut revoked: HashSet<(String, String)> = HashSet::new();
        let mut calls: u32 = 0;

        'providers: for ranked in &ranking {
            let Some(provider) = snapshot.provider(&ranked.provider) else {
                continue;
            };
            let Some(adapter) = self.adapters.get(provider.adapter_key()) else {
                tracing::warn!(
                    provider = %provider.id,
                    adapter = %provider.adapter_key(),
                    "No adapter registered, skipping provider"
                );
                continue;
            };

            for model in candidate_models(provider, request.capability, request.preferred_model.as_deref()) {
                loop {
                    if calls >= policy.max_attempts {
                        break 'providers;
                    }
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        return Err(self.cancelled(request, attempts));
                    }

                    let excluded: HashSet<String> = provider
                        .credentials
                        .iter()
                        .filter(|c| {
                            revoked.contains(&(provider.id.clone(), c.id.clone()))
                                || passed.contains(&HealthKey::new(
                                    provider.id.as_str(),
                                    c.id.as_str(),
                                    model.id.as_str(),
                                ))
                        })
                        .map(|c| c.id.clone())
                        .collect();

                    let Some(handle) = self.credentials.acquire_excluding(provider, model, &excluded) else {
                        if excluded.len() < provider.credentials.len() {
                            skipped.push(SkippedCandidate {
                                provider: provider.id.clone(),
                                credential: None,
                                model: model.id.clone(),
                                reason: SkipReason::QuotaExhausted,
                            });
                        }
                        break;
                    };

                    let key = HealthKey::new(provider.id.as_str(), handle.id(), model.id.as_str());
                    passed.insert(key.clone());

                    if !self.health.is_available(&key, &policy.health) {
                        skipped.push(skip(&key, SkipReason::CircuitOpen));
                        continue;
                    }
                    if !self.credentials.record_use(&handle) {
                        self.health.release_trial(&key);
                        skipped.push(skip(&key, SkipReason::QuotaRaced));
                        continue;
                    }

                    calls += 1;
                    let attempt = Attempt {
                        request_id: request.id,
                        number: calls,
                        key: &key,
                        model,
                        snapshot_version: snapshot.version(),
                        window_size: policy.scoring.window_size,
                    };
                    self.metrics.record_attempt(&provider.id, attempt.number);

                    let timeout = request.timeout.unwrap_or_else(|| provider.timeout());
                    let guard = AttemptGuard {
                        router: self,
                        attempt: &attempt,
                        policy: &policy.health,
                        started: Instant::now(),
                        armed: true,
                    };

                    let call = tokio::time::timeout(timeout, adapter.call(&handle, &model.id, request));
                    let outcome = match cancel {
                        Some(token) => {
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => None,
                                result = call => Some(result),
                            }
                        }
                        None => Some(call.await),
                    };
                    let latency = guard.started.elapsed();

                    let Some(outcome) = outcome else {
                        // Dropping the armed guard records the interrupted call
                        drop(guard);
                        attempts.push(attempt.record(
                            ErrorClass::Cancelled,
                            "cancelled by caller".to_string(),
                            latency,
                        ));
                        return Err(RouterError::Cancelled { attempts });
                    };
                    guard.disarm();

                    let result = outcome.unwrap_or_else(|_| {
                        Err(AdapterError::transient(format!(
                            "no response within {} ms",
                            timeout.as_millis()
                        )))
                    });

                    match result {
                        Ok(response) => {
                            let cost = response.cost.unwrap_or(model.cost_per_call);
                            self.finish_success(&attempt, latency, cost);
                            return Ok(RoutedResponse {
                                payload: response.payload,
                                provider: provider.id.clone(),
                                credential: handle.id().to_string(),
                                model: model.id.clone(),
                                attempts: attempt.number,
                                latency,
                                snapshot_version: snapshot.version(),
                            });
                        }
                        Err(error) => {
                            let record = self.finish_failure(&attempt, &policy.health, &error, latency);
                            match error.class {
                                ErrorClass::ContentRejected => {
                                    self.metrics.content_rejected.inc();
                                    return Err(RouterError::ContentRejected {
                                        attempt: record,
                                        previous: attempts,
                                    });
                                }
                                ErrorClass::RateLimited => self.credentials.mark_rate_limited(&handle),
                                ErrorClass::AuthenticationFailed => {
                                    self.health.open_credential(
                                        &provider.id,
                                        handle.id(),
                                        provider.models.iter().map(|m| m.id.as_str()),
                                        error.class,
                                        &policy.health,
                                    );
                                    revoked.insert((provider.id.clone(), handle.id().to_string()));
                                }
                                ErrorClass::Transient | ErrorClass::Cancelled => {}
                            }
                            attempts.push(record);
                        }
                    }
                }
            }
        }

        self.metrics.exhausted.inc();
        tracing::warn!(
            request_id = %request.id,
            capability = %request.capability,
            attempts = attempts.len(),
            skipped = skipped.len(),
            "All routing candidates exhausted"
        );
        Err(RouterError::Exhausted {
            capability: request.capability,
            attempts,
            skipped,
        })
    }

    fn cancelled(&self, request: &RouteRequest, attempts: Vec<AttemptRecord>) -> RouterError {
        self.metrics.cancelled.inc();
        tracing::info!(request_id = %request.id, attempts = attempts.len(), "Request cancelled");
        RouterError::Cancelled { attempts }
    }

    fn finish_success(&self, attempt: &Attempt<'_>, latency: Duration, cost: f64) {
        let key = attempt.key;
        self.health.record_success(key);
        self.scorer
            .record_outcome(&key.provider, true, latency, cost, attempt.window_size);
        self.metrics
            .record_attempt_outcome(&key.provider, Ok(()), latency);
        self.metrics.successes.inc();
        self.events
            .emit(RouterEvent::Decision(attempt.decision(AttemptOutcome::Success, latency)));

        tracing::debug!(
            request_id = %attempt.request_id,
            attempt = attempt.number,
            provider = %key.provider,
            credential = %key.credential,
            model = %key.model,
            latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            "Provider call succeeded"
        );
    }

    fn finish_failure(
        &self,
        attempt: &Attempt<'_>,
        policy: &HealthPolicy,
        error: &AdapterError,
        latency: Duration,
    ) -> AttemptRecord {
        let key = attempt.key;
        self.health.record_failure(key, error.class, policy);
        self.scorer
            .record_outcome(&key.provider, false, latency, 0.0, attempt.window_size);
        self.metrics
            .record_attempt_outcome(&key.provider, Err(error.class), latency);
        self.events.emit(RouterEvent::Decision(
            attempt.decision(AttemptOutcome::Failure { class: error.class }, latency),
        ));

        tracing::warn!(
            request_id = %attempt.request_id,
            attempt = attempt.number,
            provider = %key.provider,
            credential = %key.credential,
            model = %key.model,
            class = %error.class,
            error = %error.message,
            "Provider call failed"
        );
        attempt.record(error.class, error.message.clone(), latency)
    }

    // ========================================================================
    // Reload
    // ========================================================================

    /// Validate `config` and make it the active snapshot
    ///
    /// On error the active snapshot is unchanged. On success, requests
    /// already running finish against the snapshot they started with, and
    /// state for providers or credentials that no longer exist is dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if validation fails or an enabled provider
    /// has no registered adapter.
    pub fn reload(&self, config: RouterConfig) -> Result<u64, ConfigError> {
        let result = self
            .store
            .replace(config, self.clock.now(), |cfg| check_adapters(cfg, &self.adapters));

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected configuration reload");
                return Err(e);
            }
        };

        let credentials = snapshot.credential_keys();
        let providers = snapshot.provider_ids();
        self.credentials.retain(&credentials);
        self.health.retain(&credentials);
        self.scorer.retain(&providers);
        self.metrics.retain(&providers);

        tracing::info!(
            version = snapshot.version(),
            providers = providers.len(),
            "Configuration reloaded"
        );
        self.events.emit(RouterEvent::Reloaded {
            version: snapshot.version(),
            providers: providers.len(),
        });
        Ok(snapshot.version())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// The active configuration snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.store.load()
    }

    /// Status of every provider in declared order
    #[must_use]
    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        let snapshot = self.store.load();
        let enabled: Vec<&str> = snapshot
            .providers()
            .filter(|p| p.enabled)
            .map(|p| p.id.as_str())
            .collect();
        let ranking = self.scorer.rank(&enabled, &snapshot.policy().scoring);

        snapshot
            .providers()
            .map(|provider| {
                let ranked = ranking.iter().find(|r| r.provider == provider.id);
                let circuits = self
                    .health
                    .provider_status(&provider.id)
                    .into_iter()
                    .map(|(key, breaker)| CircuitStatus {
                        credential: key.credential,
                        model: key.model,
                        breaker,
                    })
                    .collect();

                ProviderStatus {
                    id: provider.id.clone(),
                    enabled: provider.enabled,
                    snapshot_version: snapshot.version(),
                    score: ranked.map(|r| r.score),
                    score_is_prior: ranked.is_some_and(|r| r.prior),
                    stats: self.scorer.stats(&provider.id),
                    credentials: self.credentials.status(provider),
                    circuits,
                }
            })
            .collect()
    }

    /// Router-level counters
    #[must_use]
    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Counters in Prometheus text format
    #[must_use]
    pub fn metrics_prometheus(&self) -> String {
        self.metrics.to_prometheus()
    }

    /// Subscribe to routing decisions, circuit transitions and reloads
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Attempt Bookkeeping
// ============================================================================

fn candidate_models<'a>(
    provider: &'a ProviderConfig,
    capability: Capability,
    preferred: Option<&str>,
) -> Vec<&'a ModelConfig> {
    let mut models: Vec<&ModelConfig> = provider
        .models
        .iter()
        .filter(|m| m.supports(capability))
        .collect();
    if let Some(preferred) = preferred {
        models.sort_by_key(|m| m.id != preferred);
    }
    models
}

fn skip(key: &HealthKey, reason: SkipReason) -> SkippedCandidate {
    SkippedCandidate {
        provider: key.provider.clone(),
        credential: Some(key.credential.clone()),
        model: key.model.clone(),
        reason,
    }
}

/// One provider call in flight
struct Attempt<'a> {
    request_id: Uuid,
    number: u32,
    key: &'a HealthKey,
    model: &'a ModelConfig,
    snapshot_version: u64,
    window_size: usize,
}

impl Attempt<'_> {
    fn decision(&self, outcome: AttemptOutcome, latency: Duration) -> RoutingDecision {
        RoutingDecision {
            request_id: self.request_id,
            attempt: self.number,
            provider: self.key.provider.clone(),
            credential: self.key.credential.clone(),
            model: self.model.id.clone(),
            outcome,
            latency,
            snapshot_version: self.snapshot_version,
        }
    }

    fn record(&self, class: ErrorClass, message: String, latency: Duration) -> AttemptRecord {
        AttemptRecord {
            attempt: self.number,
            provider: self.key.provider.clone(),
            credential: self.key.credential.clone(),
            model: self.model.id.clone(),
            class,
            message,
            latency,
        }
    }
}

/// Records a `Cancelled` failure if dropped while armed
///
/// The router future can be dropped at the `.await` on the provider call;
/// this guard makes sure health and scoring still see that attempt.
struct AttemptGuard<'a> {
    router: &'a Router,
    attempt: &'a Attempt<'a>,
    policy: &'a HealthPolicy,
    started: Instant,
    armed: bool,
}

impl AttemptGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let latency = self.started.elapsed();
        let router = self.router;
        let key = self.attempt.key;

        router.health.record_failure(key, ErrorClass::Cancelled, self.policy);
        router
            .scorer
            .record_outcome(&key.provider, false, latency, 0.0, self.attempt.window_size);
        router
            .metrics
            .record_attempt_outcome(&key.provider, Err(ErrorClass::Cancelled), latency);
        router.metrics.cancelled.inc();
        router.events.emit(RouterEvent::Decision(self.attempt.decision(
            AttemptOutcome::Failure {
                class: ErrorClass::Cancelled,
            },
            latency,
        )));

        tracing::warn!(
            request_id = %self.attempt.request_id,
            attempt = self.attempt.number,
            key = %key,
            "Provider call cancelled in flight"
        );
    }
}

/// Tracks the in-flight gauge for one request
struct InFlight<'a>(&'a RouterMetrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a RouterMetrics) -> Self {
        metrics.in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.dec();
    }
}
