//! Credential Pool
//!
//! Tracks per-credential, per-model request counters in fixed minute and
//! UTC-day windows and picks the least-recently-used credential that still
//! has quota. Windows roll over lazily: every operation captures `now` once
//! and resets whatever window boundary has passed before looking at the
//! counters.
//!
//! Selection ([`CredentialPool::acquire`]) never charges quota. Charging
//! happens in [`CredentialPool::record_use`] when a call is actually made,
//! as a check-and-increment under the credential's lock, so concurrent
//! requests can never push a counter past its limit.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, DurationRound, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::{CredentialConfig, ModelConfig, ProviderConfig, QuotaLimits};

// ============================================================================
// Credential Handle
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
enum SecretSource {
    Inline(String),
    Env(String),
    Missing,
}

/// An opaque reference to a credential, selected for one model
///
/// Adapters obtain the secret through [`CredentialHandle::secret`]; the
/// handle's `Debug` output never contains it.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialHandle {
    provider: String,
    credential: String,
    model: String,
    limits: QuotaLimits,
    secret: SecretSource,
}

impl CredentialHandle {
    fn new(provider: &ProviderConfig, credential: &CredentialConfig, model: &ModelConfig) -> Self {
        let secret = match (&credential.secret, &credential.secret_env) {
            (Some(inline), _) => SecretSource::Inline(inline.clone()),
            (None, Some(var)) => SecretSource::Env(var.clone()),
            (None, None) => SecretSource::Missing,
        };
        Self {
            provider: provider.id.clone(),
            credential: credential.id.clone(),
            model: model.id.clone(),
            limits: credential.limits_for(model),
            secret,
        }
    }

    /// Provider this credential belongs to
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Credential id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.credential
    }

    /// Model the handle was acquired for
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Effective limits for the model
    #[must_use]
    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Resolve the secret; environment-backed secrets are read on each call
    #[must_use]
    pub fn secret(&self) -> Option<String> {
        match &self.secret {
            SecretSource::Inline(secret) => Some(secret.clone()),
            SecretSource::Env(var) => std::env::var(var).ok(),
            SecretSource::Missing => None,
        }
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("provider", &self.provider)
            .field("credential", &self.credential)
            .field("model", &self.model)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Quota Windows
// ============================================================================

fn minute_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(now)
}

fn next_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    minute_start(now) + chrono::Duration::minutes(1)
}

#[derive(Debug, Default)]
struct QuotaWindow {
    minute: Option<DateTime<Utc>>,
    day: Option<NaiveDate>,
    minute_used: u32,
    day_used: u32,
    throttled_until: Option<DateTime<Utc>>,
}

impl QuotaWindow {
    fn roll(&mut self, now: DateTime<Utc>) {
        let minute = minute_start(now);
        if self.minute != Some(minute) {
            if self.minute_used > 0 {
                tracing::debug!(used = self.minute_used, "Minute quota window rolled over");
            }
            self.minute = Some(minute);
            self.minute_used = 0;
        }

        let day = now.date_naive();
        if self.day != Some(day) {
            if self.day_used > 0 {
                tracing::debug!(used = self.day_used, "Daily quota window rolled over");
            }
            self.day = Some(day);
            self.day_used = 0;
        }

        if self.throttled_until.is_some_and(|until| now >= until) {
            self.throttled_until = None;
        }
    }

    fn is_throttled(&self) -> bool {
        self.throttled_until.is_some()
    }

    fn has_room(&self, limits: QuotaLimits) -> bool {
        let under = |used: u32, limit: Option<u32>| limit.is_none() || limit.is_some_and(|l| used < l);
        !self.is_throttled()
            && under(self.minute_used, limits.requests_per_minute)
            && under(self.day_used, limits.requests_per_day)
    }
}

#[derive(Debug, Default)]
struct CredentialState {
    last_used: Option<DateTime<Utc>>,
    windows: HashMap<String, QuotaWindow>,
}

impl CredentialState {
    fn window(&mut self, model: &str, now: DateTime<Utc>) -> &mut QuotaWindow {
        let window = self.windows.entry(model.to_string()).or_default();
        window.roll(now);
        window
    }
}

// ============================================================================
// Status
// ============================================================================

/// Quota usage of one credential for one model
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    /// Model id
    pub model: String,
    /// Requests charged in the current minute
    pub minute_used: u32,
    /// Minute limit (`None` = unlimited)
    pub minute_limit: Option<u32>,
    /// Requests charged today (UTC)
    pub day_used: u32,
    /// Daily limit (`None` = unlimited)
    pub day_limit: Option<u32>,
    /// Calls left before a limit is hit (`None` = unlimited)
    pub remaining: Option<u32>,
    /// Soft-disabled after a rate-limit response
    pub throttled: bool,
}

/// Quota usage of one credential
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    /// Credential id
    pub id: String,
    /// Last time a call was charged to this credential
    pub last_used: Option<DateTime<Utc>>,
    /// Per-model usage in declared model order
    pub models: Vec<QuotaStatus>,
}

// ============================================================================
// Pool
// ============================================================================

type CredentialKey = (String, String);

/// Quota tracking and credential selection for all providers
#[derive(Debug)]
pub struct CredentialPool {
    clock: Arc<dyn Clock>,
    states: DashMap<CredentialKey, Mutex<CredentialState>>,
}

impl CredentialPool {
    /// Create an empty pool reading time from `clock`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            states: DashMap::new(),
        }
    }

    fn with_state<R>(
        &self,
        provider: &str,
        credential: &str,
        f: impl FnOnce(&mut CredentialState) -> R,
    ) -> R {
        let key = (provider.to_string(), credential.to_string());
        if let Some(entry) = self.states.get(&key) {
            return f(&mut entry.lock());
        }
        let entry = self.states.entry(key).or_default();
        let mut state = entry.lock();
        f(&mut state)
    }

    /// Pick the least-recently-used credential with quota left for `model`
    ///
    /// Returns `None` when every credential is throttled or out of quota.
    /// Never blocks and never charges quota.
    #[must_use]
    pub fn acquire(&self, provider: &ProviderConfig, model: &ModelConfig) -> Option<CredentialHandle> {
        self.acquire_excluding(provider, model, &HashSet::new())
    }

    /// Like [`acquire`](Self::acquire), skipping credential ids in `excluded`
    #[must_use]
    pub fn acquire_excluding(
        &self,
        provider: &ProviderConfig,
        model: &ModelConfig,
        excluded: &HashSet<String>,
    ) -> Option<CredentialHandle> {
        let now = self.clock.now();

        let mut best: Option<(Option<DateTime<Utc>>, &CredentialConfig)> = None;
        for credential in &provider.credentials {
            if excluded.contains(&credential.id) {
                continue;
            }
            let limits = credential.limits_for(model);
            let candidate = self.with_state(&provider.id, &credential.id, |state| {
                let last_used = state.last_used;
                state
                    .window(&model.id, now)
                    .has_room(limits)
                    .then_some(last_used)
            });

            // Never-used sorts before any timestamp; ties keep declared order
            if let Some(last_used) = candidate {
                let better = match &best {
                    Some((best_used, _)) => last_used < *best_used,
                    None => true,
                };
                if better {
                    best = Some((last_used, credential));
                }
            }
        }

        best.map(|(_, credential)| CredentialHandle::new(provider, credential, model))
    }

    /// Charge one call to the handle's credential and model
    ///
    /// Returns `false` without charging if the window filled up since the
    /// handle was acquired.
    pub fn record_use(&self, handle: &CredentialHandle) -> bool {
        let now = self.clock.now();
        self.with_state(&handle.provider, &handle.credential, |state| {
            let window = state.window(&handle.model, now);
            if !window.has_room(handle.limits) {
                return false;
            }
            window.minute_used = window.minute_used.saturating_add(1);
            window.day_used = window.day_used.saturating_add(1);
            state.last_used = Some(now);
            true
        })
    }

    /// Soft-disable the handle's credential for its model until the next minute
    pub fn mark_rate_limited(&self, handle: &CredentialHandle) {
        let now = self.clock.now();
        let until = next_minute(now);
        self.with_state(&handle.provider, &handle.credential, |state| {
            state.window(&handle.model, now).throttled_until = Some(until);
        });
        tracing::info!(
            provider = %handle.provider,
            credential = %handle.credential,
            model = %handle.model,
            until = %until,
            "Credential soft-disabled after rate limit"
        );
    }

    /// Usage of every credential of `provider`, in declared order
    #[must_use]
    pub fn status(&self, provider: &ProviderConfig) -> Vec<CredentialStatus> {
        let now = self.clock.now();
        provider
            .credentials
            .iter()
            .map(|credential| {
                self.with_state(&provider.id, &credential.id, |state| {
                    let models = provider
                        .models
                        .iter()
                        .map(|model| {
                            let limits = credential.limits_for(model);
                            let window = state.window(&model.id, now);
                            quota_status(&model.id, window, limits)
                        })
                        .collect();
                    CredentialStatus {
                        id: credential.id.clone(),
                        last_used: state.last_used,
                        models,
                    }
                })
            })
            .collect()
    }

    /// Drop state for credentials not in `keep`
    pub fn retain(&self, keep: &HashSet<(String, String)>) {
        self.states.retain(|key, _| keep.contains(key));
    }

    /// Number of credentials with tracked state
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

fn quota_status(model: &str, window: &QuotaWindow, limits: QuotaLimits) -> QuotaStatus {
    let minute_left = limits
        .requests_per_minute
        .map(|limit| limit.saturating_sub(window.minute_used));
    let day_left = limits
        .requests_per_day
        .map(|limit| limit.saturating_sub(window.day_used));
    let remaining = match (minute_left, day_left) {
        (Some(m), Some(d)) => Some(m.min(d)),
        (m, d) => m.or(d),
    };
    let remaining = if window.is_throttled() {
        Some(0)
    } else {
        remaining
    };

    QuotaStatus {
        model: model.to_string(),
        minute_used: window.minute_used,
        minute_limit: limits.requests_per_minute,
        day_used: window.day_used,
        day_limit: limits.requests_per_day,
        remaining,
        throttled: window.is_throttled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Capability;
    use chrono::TimeZone;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 10, 23, 58, 10).unwrap(),
        ))
    }

    fn provider(credentials: &[&str], per_minute: Option<u32>, per_day: Option<u32>) -> ProviderConfig {
        credentials.iter().fold(
            ProviderConfig::new("vendor-a").with_model(
                ModelConfig::new("fast", &[Capability::Text]).with_limits(per_minute, per_day),
            ),
            |p, id| p.with_credential(CredentialConfig::inline(*id, format!("secret-{id}"))),
        )
    }

    #[test]
    fn test_acquire_rotates_least_recently_used() {
        let clock = clock();
        let pool = CredentialPool::new(clock.clone());
        let provider = provider(&["k1", "k2", "k3"], None, None);
        let model = &provider.models[0];

        let mut order = Vec::new();
        for _ in 0..4 {
            let handle = pool.acquire(&provider, model).unwrap();
            assert!(pool.record_use(&handle));
            order.push(handle.id().to_string());
            clock.advance(Duration::from_millis(10));
        }
        assert_eq!(order, vec!["k1", "k2", "k3", "k1"]);
    }

    #[test]
    fn test_acquire_skips_exhausted_and_excluded() {
        let pool = CredentialPool::new(clock());
        let provider = provider(&["k1", "k2"], Some(1), None);
        let model = &provider.models[0];

        let first = pool.acquire(&provider, model).unwrap();
        assert!(pool.record_use(&first));

        let second = pool.acquire(&provider, model).unwrap();
        assert_eq!(second.id(), "k2");

        let excluded: HashSet<String> = ["k2".to_string()].into();
        assert!(pool.acquire_excluding(&provider, model, &excluded).is_none());

        assert!(pool.record_use(&second));
        assert!(pool.acquire(&provider, model).is_none());
    }

    #[test]
    fn test_record_use_refuses_past_limit() {
        let pool = CredentialPool::new(clock());
        let provider = provider(&["k1"], Some(2), None);
        let handle = pool.acquire(&provider, &provider.models[0]).unwrap();

        assert!(pool.record_use(&handle));
        assert!(pool.record_use(&handle));
        assert!(!pool.record_use(&handle));

        let status = pool.status(&provider);
        assert_eq!(status[0].models[0].minute_used, 2);
        assert_eq!(status[0].models[0].remaining, Some(0));
    }

    #[test]
    fn test_minute_rollover() {
        let clock = clock();
        let pool = CredentialPool::new(clock.clone());
        let provider = provider(&["k1"], Some(1), Some(10));
        let model = &provider.models[0];

        let handle = pool.acquire(&provider, model).unwrap();
        assert!(pool.record_use(&handle));
        assert!(pool.acquire(&provider, model).is_none());

        clock.advance(Duration::from_secs(50));
        let handle = pool.acquire(&provider, model).unwrap();
        assert!(pool.record_use(&handle));

        let status = pool.status(&provider);
        assert_eq!(status[0].models[0].minute_used, 1);
        assert_eq!(status[0].models[0].day_used, 2);
    }

    #[test]
    fn test_day_rollover() {
        let clock = clock();
        let pool = CredentialPool::new(clock.clone());
        let provider = provider(&["k1"], None, Some(2));
        let model = &provider.models[0];

        for _ in 0..2 {
            let handle = pool.acquire(&provider, model).unwrap();
            assert!(pool.record_use(&handle));
        }
        assert!(pool.acquire(&provider, model).is_none());

        // 23:58:10 + 5 minutes crosses midnight UTC
        clock.advance(Duration::from_secs(300));
        assert!(pool.acquire(&provider, model).is_some());
        assert_eq!(pool.status(&provider)[0].models[0].day_used, 0);
    }

    #[test]
    fn test_rate_limited_until_next_minute() {
        let clock = clock();
        let pool = CredentialPool::new(clock.clone());
        let provider = provider(&["k1"], None, None);
        let model = &provider.models[0];

        let handle = pool.acquire(&provider, model).unwrap();
        pool.mark_rate_limited(&handle);
        assert!(pool.acquire(&provider, model).is_none());
        assert!(!pool.record_use(&handle));
        assert!(pool.status(&provider)[0].models[0].throttled);

        clock.advance(Duration::from_secs(50));
        assert!(pool.acquire(&provider, model).is_some());
    }

    #[test]
    fn test_per_credential_override() {
        let pool = CredentialPool::new(clock());
        let mut provider = provider(&["k1"], Some(5), None);
        provider.credentials[0] = CredentialConfig::inline("k1", "s").with_limits(
            "fast",
            QuotaLimits {
                requests_per_minute: Some(1),
                requests_per_day: None,
            },
        );
        let handle = pool.acquire(&provider, &provider.models[0]).unwrap();
        assert_eq!(handle.limits().requests_per_minute, Some(1));
        assert!(pool.record_use(&handle));
        assert!(!pool.record_use(&handle));
    }

    #[test]
    fn test_concurrent_record_use_respects_limit() {
        let pool = Arc::new(CredentialPool::new(clock()));
        let provider = provider(&["k1"], Some(10), Some(10));
        let handle = pool.acquire(&provider, &provider.models[0]).unwrap();

        let threads: Vec<_> = (0..50)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let handle = handle.clone();
                std::thread::spawn(move || pool.record_use(&handle))
            })
            .collect();
        let granted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 10);
        let status = pool.status(&provider);
        assert_eq!(status[0].models[0].minute_used, 10);
        assert_eq!(status[0].models[0].day_used, 10);
    }

    #[test]
    fn test_retain_prunes_removed_credentials() {
        let pool = CredentialPool::new(clock());
        let provider = provider(&["k1", "k2"], None, None);
        let _ = pool.status(&provider);
        assert_eq!(pool.tracked(), 2);

        let keep: HashSet<_> = [("vendor-a".to_string(), "k2".to_string())].into();
        pool.retain(&keep);
        assert_eq!(pool.tracked(), 1);
    }

    #[test]
    fn test_handle_debug_hides_secret() {
        let pool = CredentialPool::new(clock());
        let provider = provider(&["k1"], None, None);
        let handle = pool.acquire(&provider, &provider.models[0]).unwrap();

        assert_eq!(handle.secret().as_deref(), Some("secret-k1"));
        let debug = format!("{handle:?}");
        assert!(debug.contains("k1"));
        assert!(!debug.contains("secret-k1"));
    }
}
