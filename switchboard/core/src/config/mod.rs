//! Router Configuration
//!
//! Provider, model and credential definitions plus the routing policy
//! (attempt cap, circuit breaker curve, scoring weights). Configuration is
//! plain serde data loaded from TOML; a validated copy becomes an immutable
//! [`ConfigSnapshot`](crate::routing::ConfigSnapshot) on reload.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`SWITCHBOARD_*`)
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [policy]
//! max_attempts = 5
//!
//! [policy.health]
//! failure_threshold = 3
//! base_backoff_ms = 5000
//!
//! [[providers]]
//! id = "vendor-a"
//! timeout_ms = 30000
//!
//! [[providers.models]]
//! id = "fast-text"
//! capabilities = ["text"]
//! requests_per_minute = 60
//! requests_per_day = 1000
//! cost_per_call = 0.002
//!
//! [[providers.credentials]]
//! id = "key-1"
//! secret_env = "VENDOR_A_KEY_1"
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorClass;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Longest cool-down a policy may ask for
pub const MAX_BACKOFF_MS: u64 = 30 * 24 * 60 * 60 * 1000;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Capabilities
// =============================================================================

/// Kind of generation a model can serve
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Text in, text out
    Text,
    /// Image understanding
    Vision,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Vision => f.write_str("vision"),
        }
    }
}

// =============================================================================
// Routing Policy
// =============================================================================

/// Circuit breaker parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Consecutive failures that open a circuit
    pub failure_threshold: u32,

    /// Cool-down after the first opening
    pub base_backoff_ms: u64,

    /// Upper bound on the cool-down
    pub max_backoff_ms: u64,

    /// Relative jitter applied to each cool-down (0.2 = ±20%)
    pub jitter: f64,

    /// How long a HalfOpen trial claim may stay unresolved before it is reclaimed
    pub trial_grace_ms: u64,

    /// Failure classes that open the circuit immediately
    pub fatal_errors: Vec<ErrorClass>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff_ms: 5_000,
            max_backoff_ms: 300_000, // 5 minutes
            jitter: 0.2,
            trial_grace_ms: 30_000,
            fatal_errors: vec![ErrorClass::AuthenticationFailed],
        }
    }
}

impl HealthPolicy {
    /// Whether a failure class opens the circuit regardless of the threshold
    #[must_use]
    pub fn is_fatal(&self, class: ErrorClass) -> bool {
        self.fatal_errors.contains(&class)
    }

    /// Grace period for unresolved trial claims
    #[must_use]
    pub fn trial_grace(&self) -> Duration {
        Duration::from_millis(self.trial_grace_ms)
    }

    /// Un-jittered cool-down for the given backoff attempt (0-indexed)
    ///
    /// `min(max_backoff, base_backoff * 2^attempt)`
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Weights and window for provider ranking
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Weight of `1 - error_rate`
    pub reliability_weight: f64,

    /// Weight of the normalized latency term
    pub latency_weight: f64,

    /// Weight of the normalized cost term
    pub cost_weight: f64,

    /// Samples kept per provider
    pub window_size: usize,

    /// Score for providers without samples when no other provider has one either
    pub neutral_prior: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            reliability_weight: 0.5,
            latency_weight: 0.3,
            cost_weight: 0.2,
            window_size: 100,
            neutral_prior: 0.5,
        }
    }
}

/// Routing policy shared by all providers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Maximum provider calls per request
    pub max_attempts: u32,

    /// Circuit breaker parameters
    pub health: HealthPolicy,

    /// Ranking parameters
    pub scoring: ScoringPolicy,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            health: HealthPolicy::default(),
            scoring: ScoringPolicy::default(),
        }
    }
}

// =============================================================================
// Providers, Models, Credentials
// =============================================================================

/// Request limits for one credential/model pair; `None` means unlimited
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Requests allowed per wall-clock minute
    pub requests_per_minute: Option<u32>,

    /// Requests allowed per UTC day
    pub requests_per_day: Option<u32>,
}

impl QuotaLimits {
    /// Fill unset limits from `fallback`
    #[must_use]
    pub fn or(self, fallback: QuotaLimits) -> QuotaLimits {
        QuotaLimits {
            requests_per_minute: self.requests_per_minute.or(fallback.requests_per_minute),
            requests_per_day: self.requests_per_day.or(fallback.requests_per_day),
        }
    }
}

/// A model exposed by a provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier as the provider knows it
    pub id: String,

    /// What this model can serve
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    /// Default per-credential minute limit
    #[serde(default)]
    pub requests_per_minute: Option<u32>,

    /// Default per-credential daily limit
    #[serde(default)]
    pub requests_per_day: Option<u32>,

    /// Estimated cost of one call, used when the provider reports none
    #[serde(default)]
    pub cost_per_call: f64,
}

impl ModelConfig {
    /// Create a model serving the given capabilities with no limits
    pub fn new(id: impl Into<String>, capabilities: &[Capability]) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.to_vec(),
            requests_per_minute: None,
            requests_per_day: None,
            cost_per_call: 0.0,
        }
    }

    /// Set default limits
    #[must_use]
    pub fn with_limits(mut self, per_minute: Option<u32>, per_day: Option<u32>) -> Self {
        self.requests_per_minute = per_minute;
        self.requests_per_day = per_day;
        self
    }

    /// Set estimated cost per call
    #[must_use]
    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    /// Whether the model can serve a capability
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Default limits for credentials that do not override them
    #[must_use]
    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            requests_per_minute: self.requests_per_minute,
            requests_per_day: self.requests_per_day,
        }
    }
}

/// An authentication secret reference plus optional per-model limits
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Opaque identifier used in logs, status and errors
    pub id: String,

    /// Environment variable holding the secret
    #[serde(default)]
    pub secret_env: Option<String>,

    /// Inline secret
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,

    /// Per-model limit overrides (model id -> limits)
    #[serde(default)]
    pub limits: HashMap<String, QuotaLimits>,
}

impl CredentialConfig {
    /// Credential with an inline secret
    pub fn inline(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret_env: None,
            secret: Some(secret.into()),
            limits: HashMap::new(),
        }
    }

    /// Credential whose secret lives in an environment variable
    pub fn from_env(id: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret_env: Some(var.into()),
            secret: None,
            limits: HashMap::new(),
        }
    }

    /// Override limits for one model
    #[must_use]
    pub fn with_limits(mut self, model: impl Into<String>, limits: QuotaLimits) -> Self {
        self.limits.insert(model.into(), limits);
        self
    }

    /// Effective limits for a model
    #[must_use]
    pub fn limits_for(&self, model: &ModelConfig) -> QuotaLimits {
        self.limits
            .get(&model.id)
            .copied()
            .unwrap_or_default()
            .or(model.limits())
    }
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("id", &self.id)
            .field("secret_env", &self.secret_env)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("limits", &self.limits)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// A backend provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider identifier
    pub id: String,

    /// Adapter registration key (defaults to `id`)
    #[serde(default)]
    pub adapter: Option<String>,

    /// Whether the provider takes traffic
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-call timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Models, in preference order
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Credentials
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

impl ProviderConfig {
    /// Create an enabled provider with no models or credentials
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            adapter: None,
            enabled: true,
            timeout_ms: default_timeout_ms(),
            models: Vec::new(),
            credentials: Vec::new(),
        }
    }

    /// Add a model
    #[must_use]
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.models.push(model);
        self
    }

    /// Add a credential
    #[must_use]
    pub fn with_credential(mut self, credential: CredentialConfig) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Use a specific adapter registration key
    #[must_use]
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable the provider
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Adapter registration key
    #[must_use]
    pub fn adapter_key(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.id)
    }

    /// Per-call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Look up a model by id
    #[must_use]
    pub fn model(&self, model_id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

// =============================================================================
// Full Router Configuration
// =============================================================================

/// Complete router configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routing policy
    pub policy: RoutingPolicy,

    /// Providers in priority order (ties in ranking break toward earlier entries)
    pub providers: Vec<ProviderConfig>,
}

impl RouterConfig {
    /// Parse from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] on malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Add a provider
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// Replace the policy
    #[must_use]
    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of enabled providers
    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.providers.iter().filter(|p| p.enabled).count()
    }

    /// Check the configuration for structural errors
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_policy()?;

        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(invalid("provider id must not be empty"));
            }
            if !provider_ids.insert(provider.id.as_str()) {
                return Err(invalid(format!("duplicate provider id '{}'", provider.id)));
            }
            validate_provider(provider)?;
        }

        if self.enabled_count() == 0 {
            return Err(invalid("at least one enabled provider is required"));
        }
        Ok(())
    }

    fn validate_policy(&self) -> Result<(), ConfigError> {
        let policy = &self.policy;
        if policy.max_attempts == 0 {
            return Err(invalid("policy.max_attempts must be at least 1"));
        }

        let health = &policy.health;
        if health.failure_threshold == 0 {
            return Err(invalid("policy.health.failure_threshold must be at least 1"));
        }
        if health.max_backoff_ms > MAX_BACKOFF_MS {
            return Err(invalid(format!(
                "policy.health.max_backoff_ms must not exceed {MAX_BACKOFF_MS} (30 days)"
            )));
        }
        if health.base_backoff_ms > health.max_backoff_ms {
            return Err(invalid(
                "policy.health.base_backoff_ms must not exceed max_backoff_ms",
            ));
        }
        if !(0.0..1.0).contains(&health.jitter) {
            return Err(invalid("policy.health.jitter must be in [0, 1)"));
        }

        let scoring = &policy.scoring;
        let weights = [
            scoring.reliability_weight,
            scoring.latency_weight,
            scoring.cost_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid("policy.scoring weights must be non-negative"));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(invalid("policy.scoring weights must not all be zero"));
        }
        if scoring.window_size == 0 {
            return Err(invalid("policy.scoring.window_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&scoring.neutral_prior) {
            return Err(invalid("policy.scoring.neutral_prior must be in [0, 1]"));
        }
        Ok(())
    }
}

fn validate_provider(provider: &ProviderConfig) -> Result<(), ConfigError> {
    let pid = &provider.id;
    if provider.timeout_ms == 0 {
        return Err(invalid(format!("provider '{pid}': timeout_ms must be positive")));
    }

    let mut model_ids = HashSet::new();
    for model in &provider.models {
        if model.id.trim().is_empty() {
            return Err(invalid(format!("provider '{pid}': model id must not be empty")));
        }
        if !model_ids.insert(model.id.as_str()) {
            return Err(invalid(format!(
                "provider '{pid}': duplicate model id '{}'",
                model.id
            )));
        }
        if model.capabilities.is_empty() {
            return Err(invalid(format!(
                "provider '{pid}': model '{}' declares no capabilities",
                model.id
            )));
        }
        if !model.cost_per_call.is_finite() || model.cost_per_call < 0.0 {
            return Err(invalid(format!(
                "provider '{pid}': model '{}' has a negative cost",
                model.id
            )));
        }
    }

    let mut credential_ids = HashSet::new();
    for credential in &provider.credentials {
        if credential.id.trim().is_empty() {
            return Err(invalid(format!(
                "provider '{pid}': credential id must not be empty"
            )));
        }
        if !credential_ids.insert(credential.id.as_str()) {
            return Err(invalid(format!(
                "provider '{pid}': duplicate credential id '{}'",
                credential.id
            )));
        }
        if credential.secret.is_none() && credential.secret_env.is_none() {
            return Err(invalid(format!(
                "provider '{pid}': credential '{}' needs secret or secret_env",
                credential.id
            )));
        }
        if let Some(unknown) = credential
            .limits
            .keys()
            .find(|model| !model_ids.contains(model.as_str()))
        {
            return Err(invalid(format!(
                "provider '{pid}': credential '{}' overrides limits for unknown model '{unknown}'",
                credential.id
            )));
        }
    }

    if provider.enabled {
        if provider.models.is_empty() {
            return Err(invalid(format!("provider '{pid}' is enabled but has no models")));
        }
        if provider.credentials.is_empty() {
            return Err(invalid(format!(
                "provider '{pid}' is enabled but has no credentials"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/router.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("router.toml"))
}

/// Load configuration from a TOML file, then apply environment overrides
///
/// The result is not validated; validation happens when it is turned into a
/// snapshot.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config_from_path(path: &Path) -> Result<RouterConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config = RouterConfig::from_toml_str(&text)?;
    tracing::info!(
        path = %path.display(),
        providers = config.providers.len(),
        "Loaded router configuration from file"
    );

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Apply `SWITCHBOARD_*` overrides read through `lookup`
pub fn apply_env_overrides<F>(config: &mut RouterConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(n) = lookup("SWITCHBOARD_MAX_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
        config.policy.max_attempts = n;
    }
    if let Some(n) = lookup("SWITCHBOARD_FAILURE_THRESHOLD").and_then(|v| v.parse::<u32>().ok()) {
        config.policy.health.failure_threshold = n;
    }
    if let Some(ms) = lookup("SWITCHBOARD_BASE_BACKOFF_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.policy.health.base_backoff_ms = ms;
    }
}
