//! Shared test utilities: a scripted provider adapter and config builders
//!
//! The adapter plays back a queue of [`Step`]s, then repeats a default step.
//! Per-credential overrides take precedence over both, which is how tests
//! model "credential X is revoked, credential Y works".

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use switchboard_core::{
    AdapterError, Capability, CredentialConfig, CredentialHandle, ErrorClass, ManualClock,
    ModelConfig, ProviderAdapter, ProviderConfig, ProviderResponse, RouteRequest, Router,
    RouterConfig, RoutingPolicy,
};

// =============================================================================
// Gate
// =============================================================================

/// Holds a call open until the test releases it
#[derive(Debug, Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a call has reached the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the waiting call finish
    pub fn open(&self) {
        self.release.notify_one();
    }
}

// =============================================================================
// Scripted Adapter
// =============================================================================

/// What one call does
#[derive(Clone, Debug)]
pub enum Step {
    /// Succeed immediately
    Ok,
    /// Succeed, reporting a cost
    Cost(f64),
    /// Fail with a class
    Fail(ErrorClass),
    /// Wait at the gate, then succeed (`None`) or fail
    Gated(Arc<Gate>, Option<ErrorClass>),
    /// Succeed after a real delay
    Delay(Duration),
    /// Never answer
    Hang,
}

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub credential: String,
    pub model: String,
    pub request: Uuid,
}

/// Provider adapter that plays back a script
#[derive(Debug)]
pub struct ScriptedAdapter {
    name: String,
    script: Mutex<VecDeque<Step>>,
    default: Step,
    per_credential: HashMap<String, Step>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedAdapter {
    /// Always succeeds until configured otherwise
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default: Step::Ok,
            per_credential: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Steps played once, in order, before the default
    pub fn script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Step used once the script runs out
    pub fn default_step(mut self, step: Step) -> Self {
        self.default = step;
        self
    }

    /// Step always used for `credential`
    pub fn for_credential(mut self, credential: &str, step: Step) -> Self {
        self.per_credential.insert(credential.to_string(), step);
        self
    }

    pub fn always_failing(name: &str, class: ErrorClass) -> Self {
        Self::new(name).default_step(Step::Fail(class))
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Credential ids in call order
    pub fn credentials_called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.credential.clone()).collect()
    }

    fn next_step(&self, credential: &str) -> Step {
        if let Some(step) = self.per_credential.get(credential) {
            return step.clone();
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }

    fn reply(&self, credential: &CredentialHandle, model: &str) -> ProviderResponse {
        ProviderResponse::new(serde_json::json!({
            "provider": self.name,
            "credential": credential.id(),
            "model": model,
        }))
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn call(
        &self,
        credential: &CredentialHandle,
        model: &str,
        request: &RouteRequest,
    ) -> Result<ProviderResponse, AdapterError> {
        self.calls.lock().push(Call {
            credential: credential.id().to_string(),
            model: model.to_string(),
            request: request.id,
        });

        match self.next_step(credential.id()) {
            Step::Ok => Ok(self.reply(credential, model)),
            Step::Cost(cost) => Ok(self.reply(credential, model).with_cost(cost)),
            Step::Fail(class) => Err(AdapterError::new(class, format!("{} scripted {class}", self.name))),
            Step::Gated(gate, outcome) => {
                gate.entered.notify_one();
                gate.release.notified().await;
                match outcome {
                    None => Ok(self.reply(credential, model)),
                    Some(class) => Err(AdapterError::new(class, "gated failure")),
                }
            }
            Step::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.reply(credential, model))
            }
            Step::Hang => std::future::pending::<Result<ProviderResponse, AdapterError>>().await,
        }
    }
}

// =============================================================================
// Config Builders
// =============================================================================

/// Midday, so no test crosses a day boundary by accident
pub fn start_time() -> DateTime<Utc> {
    "2024-06-01T12:00:30Z".parse().unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

/// Default policy without backoff jitter
pub fn policy() -> RoutingPolicy {
    let mut policy = RoutingPolicy::default();
    policy.health.jitter = 0.0;
    policy
}

/// A text provider with one model `m` and inline credentials
pub fn provider(id: &str, credentials: &[&str]) -> ProviderConfig {
    credentials.iter().fold(
        ProviderConfig::new(id).with_model(ModelConfig::new("m", &[Capability::Text])),
        |provider, credential| {
            provider.with_credential(CredentialConfig::inline(*credential, format!("secret-{credential}")))
        },
    )
}

pub fn config(providers: Vec<ProviderConfig>) -> RouterConfig {
    providers
        .into_iter()
        .fold(RouterConfig::default().with_policy(policy()), RouterConfig::with_provider)
}

pub fn text_request() -> RouteRequest {
    RouteRequest::new(Capability::Text, serde_json::json!({ "prompt": "hello" }))
}

/// Router over `config` with every adapter registered under its key
pub fn router(
    config: RouterConfig,
    adapters: &[(&str, &Arc<ScriptedAdapter>)],
    clock: &Arc<ManualClock>,
) -> Router {
    adapters
        .iter()
        .fold(Router::builder(config), |builder, (key, adapter)| {
            builder.adapter(*key, Arc::clone(adapter) as Arc<dyn ProviderAdapter>)
        })
        .clock(Arc::clone(clock) as Arc<dyn switchboard_core::Clock>)
        .build()
        .unwrap()
}
