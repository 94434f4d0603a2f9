//! Health Monitor and Circuit Breaker
//!
//! One breaker per (provider, credential, model) triple, owned by the
//! [`HealthMonitor`] and addressed by a flat [`HealthKey`]. The router only
//! ever holds keys.
//!
//! # Circuit Breaker
//!
//! ```text
//!            threshold failures
//!            or fatal class           now >= retry_at
//! +--------+ ---------------> +------+ --------------> +----------+
//! | Closed |                  | Open |                 | HalfOpen |
//! +--------+ <-----+          +------+ <-------------- +----------+
//!                  |                   trial failed        |
//!                  |                   (backoff doubles)   |
//!                  +---------------------------------------+
//!                              trial succeeded
//! ```
//!
//! - **Closed**: traffic flows; consecutive failures are counted
//! - **Open**: traffic blocked until `retry_at = opened_at + backoff(n)`
//! - **HalfOpen**: exactly one caller holds the trial slot
//!
//! `backoff(n) = min(max_backoff, base_backoff * 2^n)` jittered by
//! `±jitter`. `n` grows on every failed trial and resets when the circuit
//! closes.
//!
//! # Thread Safety
//!
//! Breakers live in a `DashMap`, each behind its own `parking_lot::Mutex`,
//! so the trial claim is a single critical section per key. A claim that is
//! never resolved (caller vanished) is reclaimable after
//! `trial_grace_ms`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

use super::events::{CircuitTransition, EventSink, RouterEvent};
use crate::clock::Clock;
use crate::config::HealthPolicy;
use crate::error::ErrorClass;

// ============================================================================
// Keys and States
// ============================================================================

/// Identifies one breaker
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HealthKey {
    /// Provider id
    pub provider: String,
    /// Credential id
    pub credential: String,
    /// Model id
    pub model: String,
}

impl HealthKey {
    /// Build a key
    pub fn new(
        provider: impl Into<String>,
        credential: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            credential: credential.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for HealthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.credential, self.model)
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting traffic until the cool-down ends
    Open,
    /// Cool-down over, one trial allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Number of failed trials since the circuit last closed
    pub backoff_attempt: u32,
    /// When an open circuit admits its next trial
    pub retry_at: Option<DateTime<Utc>>,
    /// Whether a trial is currently claimed
    pub trial_in_flight: bool,
    /// Successful calls observed
    pub total_successes: u64,
    /// Failed calls observed
    pub total_failures: u64,
    /// Class of the most recent failure
    pub last_failure: Option<ErrorClass>,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// State machine for one key
///
/// Pure data: every method takes `now` and the policy, and returns the
/// transition it made, if any.
#[derive(Clone, Debug, Default)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    backoff_attempt: u32,
    opened_at: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
    trial_claimed_at: Option<DateTime<Utc>>,
    total_successes: u64,
    total_failures: u64,
    last_failure: Option<ErrorClass>,
}

/// Result of an availability check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit, go ahead
    Allowed,
    /// Caller holds the HalfOpen trial slot
    Trial,
    /// Blocked
    Denied,
}

impl Admission {
    /// Whether the caller may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied)
    }
}

impl CircuitBreaker {
    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Snapshot for status reporting
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        BreakerStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            backoff_attempt: self.backoff_attempt,
            retry_at: self.retry_at,
            trial_in_flight: self.trial_claimed_at.is_some(),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            last_failure: self.last_failure,
        }
    }

    /// Decide whether a call may proceed, claiming the trial slot if one is due
    pub fn admit(
        &mut self,
        key: &HealthKey,
        policy: &HealthPolicy,
        now: DateTime<Utc>,
    ) -> (Admission, Option<(CircuitState, CircuitState)>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open => {
                if self.retry_at.is_some_and(|at| now >= at) {
                    self.state = CircuitState::HalfOpen;
                    self.trial_claimed_at = Some(now);
                    tracing::info!(key = %key, "Circuit breaker half-open, admitting trial");
                    (
                        Admission::Trial,
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                } else {
                    (Admission::Denied, None)
                }
            }
            CircuitState::HalfOpen => match self.trial_claimed_at {
                None => {
                    self.trial_claimed_at = Some(now);
                    (Admission::Trial, None)
                }
                Some(claimed) if now - claimed >= to_chrono(policy.trial_grace()) => {
                    tracing::warn!(
                        key = %key,
                        claimed_at = %claimed,
                        "Trial claim went stale, reclaiming"
                    );
                    self.trial_claimed_at = Some(now);
                    (Admission::Trial, None)
                }
                Some(_) => (Admission::Denied, None),
            },
        }
    }

    /// Record a successful call
    pub fn on_success(&mut self, key: &HealthKey) -> Option<(CircuitState, CircuitState)> {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_failures = 0;

        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.backoff_attempt = 0;
            self.opened_at = None;
            self.retry_at = None;
            self.trial_claimed_at = None;
            tracing::info!(key = %key, "Circuit breaker closed, endpoint recovered");
            return Some((CircuitState::HalfOpen, CircuitState::Closed));
        }
        None
    }

    /// Record a failed call
    ///
    /// Failures that say nothing about the endpoint (`ContentRejected`) only
    /// release a held trial slot.
    pub fn on_failure(
        &mut self,
        key: &HealthKey,
        class: ErrorClass,
        policy: &HealthPolicy,
        now: DateTime<Utc>,
    ) -> Option<(CircuitState, CircuitState)> {
        self.total_failures = self.total_failures.saturating_add(1);
        if !class.is_endpoint_failure() {
            self.release_trial();
            return None;
        }

        self.last_failure = Some(class);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= policy.failure_threshold || policy.is_fatal(class) {
                    self.open(key, class, policy, now);
                    return Some((CircuitState::Closed, CircuitState::Open));
                }
                None
            }
            CircuitState::HalfOpen => {
                self.backoff_attempt = self.backoff_attempt.saturating_add(1);
                self.open(key, class, policy, now);
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Open => None,
        }
    }

    /// Open the circuit without a call of its own
    ///
    /// Used when a failure on a sibling key condemned the whole credential.
    /// An already open circuit keeps its cool-down.
    pub fn force_open(
        &mut self,
        key: &HealthKey,
        class: ErrorClass,
        policy: &HealthPolicy,
        now: DateTime<Utc>,
    ) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == CircuitState::Open {
            return None;
        }
        self.last_failure = Some(class);
        self.open(key, class, policy, now);
        Some((from, CircuitState::Open))
    }

    /// Give back a held trial slot without recording an outcome
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_claimed_at = None;
        }
    }

    fn open(&mut self, key: &HealthKey, class: ErrorClass, policy: &HealthPolicy, now: DateTime<Utc>) {
        let backoff = jittered(policy.backoff_for_attempt(self.backoff_attempt), policy.jitter);
        let retry_at = retry_after(now, backoff);

        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.retry_at = Some(retry_at);
        self.trial_claimed_at = None;

        tracing::warn!(
            key = %key,
            class = %class,
            consecutive_failures = self.consecutive_failures,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            "Circuit breaker opened"
        );
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// `now + backoff`, saturating at the latest representable instant
fn retry_after(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(backoff))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Apply `±jitter` to a cool-down
fn jittered(backoff: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return backoff;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    backoff.mul_f64(factor.max(0.0))
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Owner of every circuit breaker
#[derive(Debug)]
pub struct HealthMonitor {
    clock: Arc<dyn Clock>,
    events: EventSink,
    breakers: DashMap<HealthKey, Mutex<CircuitBreaker>>,
}

impl HealthMonitor {
    /// Create a monitor with no breakers
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, events: EventSink) -> Self {
        Self {
            clock,
            events,
            breakers: DashMap::new(),
        }
    }

    fn with_breaker<R>(&self, key: &HealthKey, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        if let Some(entry) = self.breakers.get(key) {
            return f(&mut entry.lock());
        }
        let entry = self.breakers.entry(key.clone()).or_default();
        let mut breaker = entry.lock();
        f(&mut breaker)
    }

    fn publish(&self, key: &HealthKey, change: Option<(CircuitState, CircuitState)>, now: DateTime<Utc>) {
        if let Some((from, to)) = change {
            let retry_at = if to == CircuitState::Open {
                self.breakers.get(key).and_then(|b| b.lock().retry_at)
            } else {
                None
            };
            self.events.emit(RouterEvent::CircuitTransition(CircuitTransition {
                key: key.clone(),
                from,
                to,
                at: now,
                retry_at,
            }));
        }
    }

    /// Check whether a call may go to `key`, claiming the trial slot if due
    #[must_use]
    pub fn admit(&self, key: &HealthKey, policy: &HealthPolicy) -> Admission {
        let now = self.clock.now();
        let (admission, change) = self.with_breaker(key, |b| b.admit(key, policy, now));
        self.publish(key, change, now);
        admission
    }

    /// Check whether a call may go to `key`
    ///
    /// A `true` for a HalfOpen key means the caller now holds the trial and
    /// must resolve it with a success, failure or [`release_trial`](Self::release_trial).
    #[must_use]
    pub fn is_available(&self, key: &HealthKey, policy: &HealthPolicy) -> bool {
        self.admit(key, policy).is_allowed()
    }

    /// Record a successful call
    pub fn record_success(&self, key: &HealthKey) {
        let now = self.clock.now();
        let change = self.with_breaker(key, |b| b.on_success(key));
        self.publish(key, change, now);
    }

    /// Record a failed call
    pub fn record_failure(&self, key: &HealthKey, class: ErrorClass, policy: &HealthPolicy) {
        let now = self.clock.now();
        let change = self.with_breaker(key, |b| b.on_failure(key, class, policy, now));
        self.publish(key, change, now);
    }

    /// Open the breakers of `credential` for every one of `models`
    ///
    /// A credential rejected for authentication is unusable for all of its
    /// models, not only the one that surfaced the rejection.
    pub fn open_credential<'a>(
        &self,
        provider: &str,
        credential: &str,
        models: impl IntoIterator<Item = &'a str>,
        class: ErrorClass,
        policy: &HealthPolicy,
    ) {
        let now = self.clock.now();
        for model in models {
            let key = HealthKey::new(provider, credential, model);
            let change = self.with_breaker(&key, |b| b.force_open(&key, class, policy, now));
            self.publish(&key, change, now);
        }
    }

    /// Give back a trial slot claimed by a call that never happened
    pub fn release_trial(&self, key: &HealthKey) {
        if let Some(entry) = self.breakers.get(key) {
            entry.lock().release_trial();
        }
    }

    /// Current state of a key (Closed when never seen)
    #[must_use]
    pub fn state(&self, key: &HealthKey) -> CircuitState {
        self.breakers
            .get(key)
            .map_or(CircuitState::Closed, |b| b.lock().state())
    }

    /// Status of a key, if it has been seen
    #[must_use]
    pub fn status(&self, key: &HealthKey) -> Option<BreakerStatus> {
        self.breakers.get(key).map(|b| b.lock().status())
    }

    /// Status of every tracked key of one provider, sorted by key
    #[must_use]
    pub fn provider_status(&self, provider: &str) -> Vec<(HealthKey, BreakerStatus)> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .filter(|entry| entry.key().provider == provider)
            .map(|entry| (entry.key().clone(), entry.value().lock().status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Drop breakers whose (provider, credential) is not in `keep`
    pub fn retain(&self, keep: &HashSet<(String, String)>) {
        self.breakers.retain(|key, _| {
            keep.contains(&(key.provider.clone(), key.credential.clone()))
        });
    }

    /// Number of tracked breakers
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.breakers.len()
    }
}
