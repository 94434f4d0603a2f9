//! Router Metrics
//!
//! In-process counters for the routing engine:
//! - Request outcomes (served, exhausted, rejected, cancelled)
//! - Provider calls and fallbacks
//! - Per-provider call latency
//! - Requests currently in flight
//!
//! These are cheap atomics read on demand through
//! [`Router::metrics_summary`](super::Router::metrics_summary) or rendered
//! in Prometheus text format. Nothing is persisted.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::ErrorClass;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds; values above the last land in the last bucket
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket boundaries
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let buckets = if buckets.is_empty() {
            vec![f64::MAX]
        } else {
            buckets
        };
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (milliseconds)
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        let last = self.buckets.len() - 1;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(last);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value.max(0.0) as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_secs_f64() * 1000.0);
    }

    /// Current distribution
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max,
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds
    pub buckets: Vec<f64>,
    /// Count per bucket
    pub counts: Vec<u64>,
    /// Total samples
    pub total: u64,
    /// Sum of samples (truncated to integers)
    pub sum: u64,
    /// Smallest sample
    pub min: u64,
    /// Largest sample
    pub max: u64,
    /// Mean sample
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// p50
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// p99
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Zeroed counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that goes up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtract one, stopping at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Provider Metrics
// ============================================================================

/// Call metrics for one provider
#[derive(Debug)]
pub struct ProviderMetrics {
    calls: Counter,
    successes: Counter,
    transient: Counter,
    rate_limited: Counter,
    auth_failed: Counter,
    content_rejected: Counter,
    cancelled: Counter,
    latency: Histogram,
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self {
            calls: Counter::new(),
            successes: Counter::new(),
            transient: Counter::new(),
            rate_limited: Counter::new(),
            auth_failed: Counter::new(),
            content_rejected: Counter::new(),
            cancelled: Counter::new(),
            latency: Histogram::latency_default(),
        }
    }
}

impl ProviderMetrics {
    fn summary(&self, provider: &str) -> ProviderMetricsSummary {
        let latency = self.latency.snapshot();
        ProviderMetricsSummary {
            provider: provider.to_string(),
            calls: self.calls.get(),
            successes: self.successes.get(),
            transient: self.transient.get(),
            rate_limited: self.rate_limited.get(),
            authentication_failed: self.auth_failed.get(),
            content_rejected: self.content_rejected.get(),
            cancelled: self.cancelled.get(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
        }
    }
}

/// Summary of one provider's calls
#[derive(Clone, Debug, Serialize)]
pub struct ProviderMetricsSummary {
    /// Provider id
    pub provider: String,
    /// Calls made
    pub calls: u64,
    /// Successful calls
    pub successes: u64,
    /// Transient failures
    pub transient: u64,
    /// Rate-limit failures
    pub rate_limited: u64,
    /// Authentication failures
    pub authentication_failed: u64,
    /// Content rejections
    pub content_rejected: u64,
    /// Calls interrupted by cancellation
    pub cancelled: u64,
    /// p50 call latency (bucket bound)
    pub latency_p50_ms: f64,
    /// p99 call latency (bucket bound)
    pub latency_p99_ms: f64,
    /// Mean call latency
    pub latency_mean_ms: f64,
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Centralized metrics for the router
#[derive(Debug)]
pub struct RouterMetrics {
    providers: DashMap<String, Arc<ProviderMetrics>>,

    /// Requests received
    pub requests: Counter,
    /// Requests served
    pub successes: Counter,
    /// Requests that ran out of candidates
    pub exhausted: Counter,
    /// Requests refused by a provider's content policy
    pub content_rejected: Counter,
    /// Requests cancelled by the caller
    pub cancelled: Counter,
    /// Provider calls made
    pub attempts: Counter,
    /// Calls made after the first one of a request
    pub fallbacks: Counter,
    /// Requests currently executing
    pub in_flight: Gauge,
    /// Latency of every provider call
    pub attempt_latency: Histogram,

    started_at: Instant,
}

impl RouterMetrics {
    /// Fresh metrics
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            requests: Counter::new(),
            successes: Counter::new(),
            exhausted: Counter::new(),
            content_rejected: Counter::new(),
            cancelled: Counter::new(),
            attempts: Counter::new(),
            fallbacks: Counter::new(),
            in_flight: Gauge::default(),
            attempt_latency: Histogram::latency_default(),
            started_at: Instant::now(),
        }
    }

    fn provider(&self, provider: &str) -> Arc<ProviderMetrics> {
        if let Some(metrics) = self.providers.get(provider) {
            return Arc::clone(metrics.value());
        }
        Arc::clone(self.providers.entry(provider.to_string()).or_default().value())
    }

    /// Record the start of a provider call
    pub fn record_attempt(&self, provider: &str, attempt: u32) {
        self.attempts.inc();
        if attempt > 1 {
            self.fallbacks.inc();
        }
        self.provider(provider).calls.inc();
    }

    /// Record how a provider call ended
    pub fn record_attempt_outcome(&self, provider: &str, outcome: Result<(), ErrorClass>, latency: Duration) {
        self.attempt_latency.record_duration(latency);
        let metrics = self.provider(provider);
        metrics.latency.record_duration(latency);
        match outcome {
            Ok(()) => metrics.successes.inc(),
            Err(ErrorClass::Transient) => metrics.transient.inc(),
            Err(ErrorClass::RateLimited) => metrics.rate_limited.inc(),
            Err(ErrorClass::AuthenticationFailed) => metrics.auth_failed.inc(),
            Err(ErrorClass::ContentRejected) => metrics.content_rejected.inc(),
            Err(ErrorClass::Cancelled) => metrics.cancelled.inc(),
        }
    }

    /// Forget providers not in `keep`
    pub fn retain(&self, keep: &std::collections::HashSet<String>) {
        self.providers.retain(|id, _| keep.contains(id));
    }

    /// Time since the metrics were created
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current values
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let latency = self.attempt_latency.snapshot();
        let mut providers: Vec<ProviderMetricsSummary> = self
            .providers
            .iter()
            .map(|entry| entry.value().summary(entry.key()))
            .collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));

        MetricsSummary {
            uptime_seconds: self.uptime().as_secs(),
            requests: self.requests.get(),
            successes: self.successes.get(),
            exhausted: self.exhausted.get(),
            content_rejected: self.content_rejected.get(),
            cancelled: self.cancelled.get(),
            attempts: self.attempts.get(),
            fallbacks: self.fallbacks.get(),
            in_flight: self.in_flight.get(),
            attempt_latency_p50_ms: latency.p50(),
            attempt_latency_p99_ms: latency.p99(),
            providers,
        }
    }

    /// Render in Prometheus text exposition format
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let summary = self.summary();
        let mut output = String::new();

        let counters = [
            ("switchboard_requests_total", "Requests received", summary.requests),
            ("switchboard_successes_total", "Requests served", summary.successes),
            ("switchboard_exhausted_total", "Requests with no remaining candidate", summary.exhausted),
            ("switchboard_rejected_total", "Requests refused for content", summary.content_rejected),
            ("switchboard_cancelled_total", "Requests cancelled by the caller", summary.cancelled),
            ("switchboard_attempts_total", "Provider calls made", summary.attempts),
            ("switchboard_fallbacks_total", "Provider calls after the first", summary.fallbacks),
        ];
        for (name, help, value) in counters {
            let _ = write!(
                output,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            );
        }

        let _ = write!(
            output,
            "# HELP switchboard_in_flight Requests executing\n\
             # TYPE switchboard_in_flight gauge\n\
             switchboard_in_flight {}\n\n",
            summary.in_flight
        );

        let families: [(&str, &str, &str, fn(&ProviderMetricsSummary) -> String); 3] = [
            ("switchboard_provider_calls_total", "Calls made per provider", "counter", |p| {
                p.calls.to_string()
            }),
            ("switchboard_provider_successes_total", "Successful calls per provider", "counter", |p| {
                p.successes.to_string()
            }),
            ("switchboard_provider_latency_p99_ms", "p99 call latency per provider", "gauge", |p| {
                p.latency_p99_ms.to_string()
            }),
        ];
        if !summary.providers.is_empty() {
            for (name, help, kind, value) in families {
                let _ = writeln!(output, "# HELP {name} {help}\n# TYPE {name} {kind}");
                for provider in &summary.providers {
                    let _ = writeln!(
                        output,
                        "{name}{{provider=\"{}\"}} {}",
                        provider.provider,
                        value(provider)
                    );
                }
                output.push('\n');
            }
        }

        output
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Router-level metrics summary
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    /// Seconds since the router was created
    pub uptime_seconds: u64,
    /// Requests received
    pub requests: u64,
    /// Requests served
    pub successes: u64,
    /// Requests that ran out of candidates
    pub exhausted: u64,
    /// Requests refused for content
    pub content_rejected: u64,
    /// Requests cancelled by the caller
    pub cancelled: u64,
    /// Provider calls made
    pub attempts: u64,
    /// Calls after the first of their request
    pub fallbacks: u64,
    /// Requests executing now
    pub in_flight: u64,
    /// p50 call latency
    pub attempt_latency_p50_ms: f64,
    /// p99 call latency
    pub attempt_latency_p99_ms: f64,
    /// Per-provider call metrics, sorted by id
    pub providers: Vec<ProviderMetricsSummary>,
}
