//! Routing invariants under concurrency and degradation
//!
//! These run real tasks on a multi-threaded runtime; the manual clock keeps
//! quota windows and breaker cool-downs fixed while they do.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use common::{
    config, manual_clock, provider, router, text_request, Gate, ScriptedAdapter, Step,
};
use switchboard_core::routing::PerformanceScorer;
use switchboard_core::{
    Capability, CircuitState, CredentialConfig, ErrorClass, ModelConfig, ProviderConfig,
    RouterError, ScoringPolicy, SkipReason,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_quota_never_exceeded_under_concurrent_requests() {
    let clock = manual_clock();
    let limited = ScriptedAdapter::new("limited").shared();
    let spare = ScriptedAdapter::new("spare").shared();

    let limited_config = ProviderConfig::new("limited")
        .with_model(ModelConfig::new("m", &[Capability::Text]).with_limits(Some(5), Some(8)))
        .with_credential(CredentialConfig::inline("k1", "s"))
        .with_credential(CredentialConfig::inline("k2", "s"));
    let router = Arc::new(router(
        config(vec![limited_config, provider("spare", &["k"])]),
        &[("limited", &limited), ("spare", &spare)],
        &clock,
    ));

    let mut tasks = JoinSet::new();
    for _ in 0..40 {
        let router = Arc::clone(&router);
        tasks.spawn(async move { router.execute(text_request()).await });
    }
    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap().is_ok());
    }

    let status = router.provider_status();
    let mut charged = 0;
    for credential in &status[0].credentials {
        let quota = &credential.models[0];
        assert!(quota.minute_used <= 5, "{} used {}", credential.id, quota.minute_used);
        assert!(quota.day_used <= 8);
        charged += quota.minute_used as usize;
    }
    assert_eq!(charged, limited.call_count());
    assert_eq!(limited.call_count() + spare.call_count(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_half_open_trial_runs_at_a_time() {
    let clock = manual_clock();
    let gate = Gate::new();
    let a = ScriptedAdapter::new("a")
        .script([
            Step::Fail(ErrorClass::Transient),
            Step::Fail(ErrorClass::Transient),
            Step::Fail(ErrorClass::Transient),
        ])
        .default_step(Step::Gated(Arc::clone(&gate), None))
        .shared();
    let router = Arc::new(router(config(vec![provider("a", &["k"])]), &[("a", &a)], &clock));

    for _ in 0..3 {
        assert!(router.execute(text_request()).await.is_err());
    }
    clock.advance(Duration::from_secs(5));

    let trial = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.execute(text_request()).await })
    };
    gate.entered().await;

    let mut contenders = JoinSet::new();
    for _ in 0..16 {
        let router = Arc::clone(&router);
        contenders.spawn(async move { router.execute(text_request()).await });
    }
    while let Some(result) = contenders.join_next().await {
        match result.unwrap() {
            Err(RouterError::Exhausted { attempts, skipped, .. }) => {
                assert!(attempts.is_empty());
                assert_eq!(skipped[0].reason, SkipReason::CircuitOpen);
            }
            other => panic!("contender should have been refused, got {other:?}"),
        }
    }
    assert_eq!(a.call_count(), 4);

    gate.open();
    let response = trial.await.unwrap().unwrap();
    assert_eq!(response.provider, "a");
    assert_eq!(router.provider_status()[0].circuits[0].breaker.state, CircuitState::Closed);
}

#[tokio::test]
async fn test_fallback_stops_at_max_attempts() {
    let clock = manual_clock();
    let adapters: Vec<(String, Arc<ScriptedAdapter>)> = (0..6)
        .map(|i| {
            let id = format!("p{i}");
            let adapter = ScriptedAdapter::always_failing(&id, ErrorClass::Transient).shared();
            (id, adapter)
        })
        .collect();
    let providers = adapters
        .iter()
        .map(|(id, _)| provider(id, &["k1", "k2"]))
        .collect();
    let registry: Vec<(&str, &Arc<ScriptedAdapter>)> =
        adapters.iter().map(|(id, a)| (id.as_str(), a)).collect();
    let router = router(config(providers), &registry, &clock);

    let err = router.execute(text_request()).await.unwrap_err();
    assert_eq!(err.attempts().len(), 5);

    let total_calls = |adapters: &[(String, Arc<ScriptedAdapter>)]| {
        adapters.iter().map(|(_, a)| a.call_count()).sum::<usize>()
    };
    assert_eq!(total_calls(&adapters), 5);

    // Keep hammering: breakers open, attempts never exceed the cap
    for round in 0..30 {
        let before = total_calls(&adapters);
        let err = router.execute(text_request()).await.unwrap_err();
        assert!(err.attempts().len() <= 5, "round {round}");
        assert!(total_calls(&adapters) - before <= 5, "round {round}");
    }

    // Every breaker has tripped by now, so nothing is called at all
    let before = total_calls(&adapters);
    match router.execute(text_request()).await.unwrap_err() {
        RouterError::Exhausted { attempts, skipped, .. } => {
            assert!(attempts.is_empty());
            assert_eq!(skipped.len(), 12);
            assert!(skipped.iter().all(|s| s.reason == SkipReason::CircuitOpen));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(total_calls(&adapters), before);
}

#[tokio::test]
async fn test_single_attempt_budget() {
    let clock = manual_clock();
    let a = ScriptedAdapter::always_failing("a", ErrorClass::Transient).shared();
    let b = ScriptedAdapter::new("b").shared();
    let mut cfg = config(vec![provider("a", &["k"]), provider("b", &["k"])]);
    cfg.policy.max_attempts = 1;
    let router = router(cfg, &[("a", &a), ("b", &b)], &clock);

    let err = router.execute(text_request()).await.unwrap_err();
    assert_eq!(err.attempts().len(), 1);
    assert_eq!(b.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_mid_request_does_not_change_its_provider_set() {
    let clock = manual_clock();
    let gate = Gate::new();
    let a = ScriptedAdapter::new("a")
        .default_step(Step::Gated(Arc::clone(&gate), Some(ErrorClass::Transient)))
        .shared();
    let b = ScriptedAdapter::new("b").shared();
    let c = ScriptedAdapter::new("c").shared();
    let router = Arc::new(router(
        config(vec![provider("a", &["k"]), provider("b", &["k"])]),
        &[("a", &a), ("b", &b), ("c", &c)],
        &clock,
    ));

    let in_flight = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.execute(text_request()).await })
    };
    gate.entered().await;

    let version = router.reload(config(vec![provider("c", &["k"])])).unwrap();
    assert_eq!(version, 2);
    gate.open();

    // The old request still falls back to b, which the new config dropped
    let old = in_flight.await.unwrap().unwrap();
    assert_eq!(old.provider, "b");
    assert_eq!(old.snapshot_version, 1);
    assert_eq!(old.attempts, 2);

    let new = router.execute(text_request()).await.unwrap();
    assert_eq!(new.provider, "c");
    assert_eq!(new.snapshot_version, 2);
    assert_eq!(a.call_count(), 1);
}

#[test]
fn test_ranking_is_deterministic() {
    let scorer = PerformanceScorer::new();
    let policy = ScoringPolicy::default();
    let samples = [
        ("p0", true, 120, 0.004),
        ("p1", false, 80, 0.0),
        ("p1", true, 95, 0.002),
        ("p2", true, 300, 0.001),
        ("p3", true, 120, 0.004),
        ("p0", false, 500, 0.0),
    ];
    for (provider, success, latency_ms, cost) in samples {
        scorer.record_outcome(provider, success, Duration::from_millis(latency_ms), cost, policy.window_size);
    }

    let candidates = ["p0", "p1", "p2", "p3", "p4", "p5"];
    let order = |scorer: &PerformanceScorer| -> Vec<String> {
        scorer
            .rank(&candidates, &policy)
            .into_iter()
            .map(|r| r.provider)
            .collect()
    };

    let first = order(&scorer);
    for _ in 0..100 {
        assert_eq!(order(&scorer), first);
    }

    // Unmeasured providers share a prior and keep declared order among themselves
    let p4 = first.iter().position(|p| p == "p4").unwrap();
    let p5 = first.iter().position(|p| p == "p5").unwrap();
    assert!(p4 < p5);
}
