//! Performance Scorer
//!
//! Keeps the last `window_size` call outcomes per provider in a ring buffer
//! and ranks providers by a composite score:
//!
//! ```text
//! score = ( w_rel  * (1 - error_rate)
//!         + w_lat  * (1 - minmax(mean_latency))
//!         + w_cost * (1 - minmax(mean_cost)) ) / (w_rel + w_lat + w_cost)
//! ```
//!
//! Min-max normalization runs across the candidates being ranked, so each
//! term lands in `[0, 1]` regardless of units. When every candidate has the
//! same value the term is `1.0` for all of them. Providers without samples
//! get the median score of the ones that have samples (or the configured
//! neutral prior when nobody does), so a new provider is neither starved
//! nor blindly preferred.
//!
//! Ranking is a pure function of the recorded samples: ties break by the
//! declared provider order and nothing is randomized.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ScoringPolicy;

#[derive(Clone, Copy, Debug)]
struct Sample {
    success: bool,
    latency: Duration,
    cost: f64,
}

#[derive(Debug, Default)]
struct ProviderWindow {
    samples: VecDeque<Sample>,
    accrued_cost: f64,
}

impl ProviderWindow {
    fn push(&mut self, sample: Sample, window_size: usize) {
        self.accrued_cost += sample.cost;
        self.samples.push_back(sample);
        while self.samples.len() > window_size.max(1) {
            self.samples.pop_front();
        }
    }

    fn stats(&self) -> ProviderStats {
        let samples = self.samples.len();
        let successes = self.samples.iter().filter(|s| s.success).count();
        let failures = samples - successes;

        let error_rate = if samples == 0 {
            0.0
        } else {
            failures as f64 / samples as f64
        };
        let mean_latency_ms = if samples == 0 {
            0.0
        } else {
            self.samples
                .iter()
                .map(|s| s.latency.as_secs_f64() * 1000.0)
                .sum::<f64>()
                / samples as f64
        };
        let mean_cost = if successes == 0 {
            0.0
        } else {
            self.samples
                .iter()
                .filter(|s| s.success)
                .map(|s| s.cost)
                .sum::<f64>()
                / successes as f64
        };

        ProviderStats {
            samples,
            successes,
            failures,
            error_rate,
            mean_latency_ms,
            mean_cost,
            accrued_cost: self.accrued_cost,
        }
    }
}

/// Rolling statistics for one provider
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProviderStats {
    /// Samples in the window
    pub samples: usize,
    /// Successful calls in the window
    pub successes: usize,
    /// Failed calls in the window
    pub failures: usize,
    /// `failures / samples`
    pub error_rate: f64,
    /// Mean call latency in milliseconds
    pub mean_latency_ms: f64,
    /// Mean cost of successful calls
    pub mean_cost: f64,
    /// Cost accrued since tracking began (not windowed)
    pub accrued_cost: f64,
}

/// A provider with its ranking score
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedProvider {
    /// Provider id
    pub provider: String,
    /// Composite score in `[0, 1]`
    pub score: f64,
    /// Declared position, used for tie-breaking
    pub priority: usize,
    /// Whether the score is a prior rather than measured
    pub prior: bool,
}

/// Rolling performance windows for every provider
#[derive(Debug, Default)]
pub struct PerformanceScorer {
    windows: DashMap<String, Mutex<ProviderWindow>>,
}

impl PerformanceScorer {
    /// Create an empty scorer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one call
    pub fn record_outcome(
        &self,
        provider: &str,
        success: bool,
        latency: Duration,
        cost: f64,
        window_size: usize,
    ) {
        let sample = Sample {
            success,
            latency,
            cost: if cost.is_finite() { cost.max(0.0) } else { 0.0 },
        };
        if let Some(window) = self.windows.get(provider) {
            window.lock().push(sample, window_size);
            return;
        }
        self.windows
            .entry(provider.to_string())
            .or_default()
            .lock()
            .push(sample, window_size);
    }

    /// Statistics for a provider, if it has ever been recorded
    #[must_use]
    pub fn stats(&self, provider: &str) -> Option<ProviderStats> {
        self.windows.get(provider).map(|w| w.lock().stats())
    }

    /// Order `candidates` (given in declared priority order) best first
    #[must_use]
    pub fn rank(&self, candidates: &[&str], policy: &ScoringPolicy) -> Vec<RankedProvider> {
        let stats: Vec<Option<ProviderStats>> = candidates
            .iter()
            .map(|id| self.stats(id).filter(|s| s.samples > 0))
            .collect();
        let scores = composite_scores(&stats, policy);

        let mut ranked: Vec<RankedProvider> = candidates
            .iter()
            .zip(scores)
            .enumerate()
            .map(|(priority, (id, score))| RankedProvider {
                provider: (*id).to_string(),
                score: score.unwrap_or(f64::NAN),
                priority,
                prior: score.is_none(),
            })
            .collect();

        let prior = median(ranked.iter().filter(|r| !r.prior).map(|r| r.score))
            .unwrap_or(policy.neutral_prior);
        for entry in ranked.iter_mut().filter(|r| r.prior) {
            entry.score = prior;
        }

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.priority.cmp(&b.priority))
        });
        ranked
    }

    /// Drop windows for providers not in `keep`
    pub fn retain(&self, keep: &HashSet<String>) {
        self.windows.retain(|id, _| keep.contains(id));
    }

    /// Number of providers with a window
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Scores for candidates with samples; `None` for the rest
fn composite_scores(stats: &[Option<ProviderStats>], policy: &ScoringPolicy) -> Vec<Option<f64>> {
    let measured = || stats.iter().flatten();
    let latency = Range::of(measured().map(|s| s.mean_latency_ms));
    let cost = Range::of(measured().map(|s| s.mean_cost));

    let total_weight = policy.reliability_weight + policy.latency_weight + policy.cost_weight;
    let total_weight = if total_weight > 0.0 { total_weight } else { 1.0 };

    stats
        .iter()
        .map(|s| {
            s.as_ref().map(|s| {
                let reliability = (1.0 - s.error_rate).clamp(0.0, 1.0);
                let raw = policy.reliability_weight * reliability
                    + policy.latency_weight * latency.inverted(s.mean_latency_ms)
                    + policy.cost_weight * cost.inverted(s.mean_cost);
                (raw / total_weight).clamp(0.0, 1.0)
            })
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
struct Range {
    min: f64,
    max: f64,
}

impl Range {
    fn of(values: impl Iterator<Item = f64>) -> Self {
        values.fold(
            Range {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            |r, v| Range {
                min: r.min.min(v),
                max: r.max.max(v),
            },
        )
    }

    /// `1 - minmax(value)`, or 1.0 when the range is empty or flat
    fn inverted(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if !span.is_finite() || span <= f64::EPSILON {
            return 1.0;
        }
        (1.0 - (value - self.min) / span).clamp(0.0, 1.0)
    }
}

fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> ScoringPolicy {
        ScoringPolicy::default()
    }

    fn order(ranked: &[RankedProvider]) -> Vec<&str> {
        ranked.iter().map(|r| r.provider.as_str()).collect()
    }

    fn record_n(scorer: &PerformanceScorer, provider: &str, n: usize, success: bool, latency_ms: u64, cost: f64) {
        for _ in 0..n {
            scorer.record_outcome(provider, success, Duration::from_millis(latency_ms), cost, 100);
        }
    }

    #[test]
    fn test_window_evicts_old_samples() {
        let scorer = PerformanceScorer::new();
        for _ in 0..5 {
            scorer.record_outcome("a", false, Duration::from_millis(10), 0.0, 3);
        }
        for _ in 0..3 {
            scorer.record_outcome("a", true, Duration::from_millis(10), 0.1, 3);
        }

        let stats = scorer.stats("a").unwrap();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.failures, 0);
        assert!((stats.accrued_cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_providers_use_declared_order() {
        let scorer = PerformanceScorer::new();
        let ranked = scorer.rank(&["a", "b", "c"], &policy());

        assert_eq!(order(&ranked), vec!["a", "b", "c"]);
        assert!(ranked.iter().all(|r| r.prior && r.score == 0.5));
    }

    #[test]
    fn test_reliability_dominates_with_default_weights() {
        let scorer = PerformanceScorer::new();
        record_n(&scorer, "a", 10, false, 100, 0.0);
        record_n(&scorer, "b", 10, true, 100, 0.0);

        let ranked = scorer.rank(&["a", "b"], &policy());
        assert_eq!(order(&ranked), vec!["b", "a"]);
        assert!((ranked[0].score - 1.0).abs() < 1e-9);
        assert!((ranked[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_latency_and_cost_normalized() {
        let scorer = PerformanceScorer::new();
        record_n(&scorer, "slow", 4, true, 400, 0.01);
        record_n(&scorer, "fast", 4, true, 100, 0.01);
        record_n(&scorer, "mid", 4, true, 250, 0.01);

        let ranked = scorer.rank(&["slow", "fast", "mid"], &policy());
        assert_eq!(order(&ranked), vec!["fast", "mid", "slow"]);

        // 0.5 reliability + 0.3 * 0.5 latency + 0.2 flat cost
        assert!((ranked[1].score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_new_provider_gets_median_prior() {
        let scorer = PerformanceScorer::new();
        record_n(&scorer, "good", 10, true, 100, 0.0);
        record_n(&scorer, "bad", 10, false, 100, 0.0);

        let ranked = scorer.rank(&["good", "bad", "new"], &policy());
        let new = ranked.iter().find(|r| r.provider == "new").unwrap();
        assert!(new.prior);
        assert!((new.score - 0.75).abs() < 1e-9);
        assert_eq!(order(&ranked), vec!["good", "new", "bad"]);
    }

    #[test]
    fn test_ties_break_by_priority() {
        let scorer = PerformanceScorer::new();
        record_n(&scorer, "a", 5, true, 100, 0.0);
        record_n(&scorer, "b", 5, true, 100, 0.0);

        assert_eq!(order(&scorer.rank(&["b", "a"], &policy())), vec!["b", "a"]);
        assert_eq!(order(&scorer.rank(&["a", "b"], &policy())), vec!["a", "b"]);
    }

    #[test]
    fn test_rank_is_deterministic() {
        let scorer = PerformanceScorer::new();
        record_n(&scorer, "a", 3, true, 120, 0.02);
        record_n(&scorer, "a", 1, false, 900, 0.0);
        record_n(&scorer, "b", 4, true, 300, 0.01);
        record_n(&scorer, "c", 2, true, 80, 0.05);

        let first = scorer.rank(&["a", "b", "c", "d"], &policy());
        for _ in 0..20 {
            assert_eq!(scorer.rank(&["a", "b", "c", "d"], &policy()), first);
        }
    }

    #[test]
    fn test_retain() {
        let scorer = PerformanceScorer::new();
        record_n(&scorer, "a", 1, true, 1, 0.0);
        record_n(&scorer, "b", 1, true, 1, 0.0);

        scorer.retain(&["b".to_string()].into());
        assert_eq!(scorer.tracked(), 1);
        assert!(scorer.stats("a").is_none());
    }

    #[test]
    fn test_median() {
        assert_eq!(median([3.0, 1.0, 2.0].into_iter()), Some(2.0));
        assert_eq!(median([4.0, 1.0].into_iter()), Some(2.5));
        assert_eq!(median(std::iter::empty()), None);
    }
}
