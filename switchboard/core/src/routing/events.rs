//! Router Events
//!
//! Structured records of what the router did: one [`RoutingDecision`] per
//! provider call, one [`CircuitTransition`] per breaker state change, and a
//! notice after each successful reload. They are published on a
//! `tokio::sync::broadcast` channel so an observability layer can attach
//! without the router depending on it. Publishing never blocks and is a
//! no-op when nobody is subscribed; slow subscribers lag and lose events
//! rather than applying backpressure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::health::{CircuitState, HealthKey};
use crate::error::ErrorClass;

/// Default channel capacity per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Outcome of a single provider call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The provider returned a response
    Success,
    /// The provider call failed
    Failure {
        /// How it failed
        class: ErrorClass,
    },
}

impl AttemptOutcome {
    /// Whether the call succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Record of one provider call within a request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Request the call belonged to
    pub request_id: Uuid,
    /// 1-based attempt number
    pub attempt: u32,
    /// Provider called
    pub provider: String,
    /// Credential id used
    pub credential: String,
    /// Model called
    pub model: String,
    /// What happened
    pub outcome: AttemptOutcome,
    /// Time spent in the call
    pub latency: Duration,
    /// Snapshot the request was routed against
    pub snapshot_version: u64,
}

/// A circuit breaker changed state
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitTransition {
    /// Whose breaker
    pub key: HealthKey,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// When it happened
    pub at: DateTime<Utc>,
    /// Earliest trial time, when the new state is `Open`
    pub retry_at: Option<DateTime<Utc>>,
}

/// Everything the router publishes
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouterEvent {
    /// A provider call finished
    Decision(RoutingDecision),
    /// A breaker changed state
    CircuitTransition(CircuitTransition),
    /// A new configuration snapshot was installed
    Reloaded {
        /// New snapshot version
        version: u64,
        /// Providers in the new snapshot
        providers: usize,
    },
}

/// Fan-out publisher for [`RouterEvent`]s
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: broadcast::Sender<RouterEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a new subscriber; it sees events emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: RouterEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Number of attached subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
