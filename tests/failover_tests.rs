//! End-to-end failover scenarios
//!
//! These tests drive the health registry, network monitor, selector,
//! dispatcher and bulk orchestrator together through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use provider_failover::analyzer::{Analysis, Analyze, FnAnalyzer, WorkItem};
use provider_failover::bulk::{BulkOptions, BulkOrchestrator, RunState, SwitchReason};
use provider_failover::clock::MockClock;
use provider_failover::dispatch::FailoverDispatcher;
use provider_failover::error::{classify, ErrorKind, ProviderFailure};
use provider_failover::health::{CircuitBreakerConfig, CircuitState, HealthRegistry};
use provider_failover::network::NetworkMonitor;
use provider_failover::provider::Provider;
use provider_failover::selector::ProviderSelector;

fn registry() -> Arc<HealthRegistry> {
    Arc::new(HealthRegistry::new(CircuitBreakerConfig::default()))
}

fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| WorkItem::new(format!("ticket {i}"))).collect()
}

fn server_error(provider: Provider) -> provider_failover::ClassifiedError {
    classify(&ProviderFailure::new("503 Service Unavailable"), provider)
}

// ============================================================================
// Health registry properties
// ============================================================================

#[test]
fn test_three_failures_open_circuit_until_sweep_after_cooldown() {
    let clock = MockClock::new(Utc::now());
    let registry = HealthRegistry::with_clock(CircuitBreakerConfig::default(), Arc::new(clock.clone()));
    let provider = Provider::Gemini;

    registry.record_failure(provider, &server_error(provider));
    registry.record_failure(provider, &server_error(provider));
    assert!(registry.is_healthy(provider));

    registry.record_failure(provider, &server_error(provider));
    assert!(!registry.is_healthy(provider));
    assert_eq!(registry.circuit_state(provider), CircuitState::Open);

    // sweep before the cool-down changes nothing
    clock.advance(chrono::Duration::seconds(30));
    assert!(registry.sweep().is_empty());
    assert!(!registry.is_healthy(provider));

    clock.advance(chrono::Duration::seconds(31));
    assert_eq!(registry.sweep(), vec![provider]);
    assert!(registry.is_healthy(provider));
    assert_eq!(registry.health(provider).consecutive_failures, 2);
    assert_eq!(registry.circuit_state(provider), CircuitState::HalfOpen);

    // one more failure from half-open reopens
    registry.record_failure(provider, &server_error(provider));
    assert_eq!(registry.circuit_state(provider), CircuitState::Open);
}

#[test]
fn test_success_closes_open_circuit() {
    let registry = registry();
    let provider = Provider::SentimentApi;
    for _ in 0..3 {
        registry.record_failure(provider, &server_error(provider));
    }
    assert!(!registry.is_healthy(provider));

    let health = registry.record_success(provider, Duration::from_millis(200));
    assert!(health.healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert!(!health.circuit_open);
    assert_eq!(registry.circuit_state(provider), CircuitState::Closed);
}

#[test]
fn test_best_provider_never_returns_unhealthy() {
    let registry = registry();
    assert_eq!(registry.best_provider(&[]), None);

    for _ in 0..3 {
        registry.record_failure(Provider::HuggingFace, &server_error(Provider::HuggingFace));
    }
    assert_eq!(
        registry.best_provider(&[Provider::HuggingFace, Provider::Ollama]),
        Some(Provider::Ollama)
    );
    assert_eq!(registry.best_provider(&[Provider::HuggingFace]), None);
}

#[test]
fn test_reset_all_is_idempotent() {
    let registry = registry();
    for _ in 0..3 {
        registry.record_failure(Provider::Ollama, &server_error(Provider::Ollama));
    }

    registry.reset_all();
    let first = registry.all_health();
    registry.reset_all();
    assert_eq!(registry.all_health(), first);
    assert!(Provider::ALL.iter().all(|p| registry.is_healthy(*p)));
}

// ============================================================================
// Network monitor
// ============================================================================

#[test]
fn test_offline_then_online_restores_network_providers() {
    let registry = registry();
    let monitor = NetworkMonitor::new(Arc::clone(&registry));
    registry.record_failure(Provider::Gemini, &server_error(Provider::Gemini));

    assert!(monitor.set_online(false));
    assert!(!registry.is_healthy(Provider::Gemini));
    assert!(!registry.is_healthy(Provider::SentimentApi));
    assert!(registry.is_healthy(Provider::HuggingFace));
    assert_eq!(
        ProviderSelector::new(Arc::clone(&registry)).select(&Provider::ALL),
        Some(Provider::HuggingFace)
    );

    assert!(monitor.set_online(true));
    for provider in [Provider::Gemini, Provider::SentimentApi] {
        assert!(registry.is_healthy(provider));
        assert_eq!(registry.health(provider).consecutive_failures, 0);
    }
}

#[tokio::test]
async fn test_monitor_subscribers_see_changes() {
    let monitor = NetworkMonitor::new(registry());
    let mut rx = monitor.subscribe();

    monitor.set_online(false);
    let state = rx.recv().await.unwrap();
    assert!(!state.online);
    assert!(!monitor.current_state().online);
}

// ============================================================================
// Single-request dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispatch_falls_back_to_local_provider() {
    let registry = registry();
    let dispatcher = FailoverDispatcher::new(
        ProviderSelector::new(Arc::clone(&registry)),
        vec![Provider::Gemini, Provider::SentimentApi, Provider::Ollama],
    );
    let analyzer = FnAnalyzer::new(|provider: Provider, _| async move {
        if provider.is_network_dependent() {
            Err(ProviderFailure::new("fetch failed: network unreachable"))
        } else {
            Ok(Analysis::new("neutral", 0.7))
        }
    });

    let dispatched = dispatcher
        .analyze(&analyzer, &WorkItem::new("where is my order"))
        .await
        .unwrap();

    assert_eq!(dispatched.provider, Provider::Ollama);
    assert_eq!(dispatched.attempts, 2);
    assert_eq!(dispatched.errors.len(), 1);
    assert_eq!(dispatched.errors[0].kind, ErrorKind::Network);
    assert_eq!(registry.health(Provider::Gemini).consecutive_failures, 1);
}

// ============================================================================
// Bulk scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bulk_switches_away_from_failing_provider() {
    let registry = registry();
    let orchestrator = BulkOrchestrator::new(Arc::clone(&registry));
    let analyzer = FnAnalyzer::new(|provider: Provider, _| async move {
        match provider {
            Provider::HuggingFace => Err(ProviderFailure::new("503 Service Unavailable")),
            _ => Ok(Analysis::new("neutral", 0.8)),
        }
    });
    let options = BulkOptions::default().with_providers(vec![Provider::HuggingFace, Provider::Ollama]);

    let outcome = orchestrator
        .run(&items(10), &analyzer, &options, |progress| {
            assert_eq!(progress.success_count + progress.error_count, progress.processed);
        })
        .await
        .unwrap();

    let stats = &outcome.stats;
    assert_eq!(stats.total_processed, 10);
    assert_eq!(stats.error_count, 3);
    assert_eq!(stats.success_count, 7);
    assert_eq!(stats.error_summary[&ErrorKind::ServerError], 3);
    assert_eq!(stats.provider_stats[&Provider::HuggingFace].failures, 3);
    assert_eq!(stats.provider_stats[&Provider::Ollama].successes, 7);

    assert_eq!(stats.provider_switches.len(), 1);
    let switch = &stats.provider_switches[0];
    assert_eq!(switch.from, Provider::HuggingFace);
    assert_eq!(switch.to, Provider::Ollama);
    assert_eq!(switch.at_item, 3);
    assert_eq!(switch.reason, SwitchReason::Unhealthy);

    assert!(outcome.results.iter().all(|r| r.provider == Provider::Ollama));
    assert_eq!(
        outcome.errors.iter().map(|e| e.index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(!registry.is_healthy(Provider::HuggingFace));
}

#[tokio::test(start_paused = true)]
async fn test_abort_returns_partial_results() {
    let orchestrator = BulkOrchestrator::new(registry());
    let calls = Arc::new(AtomicUsize::new(0));
    let reached = Arc::new(Notify::new());

    let (c, r) = (Arc::clone(&calls), Arc::clone(&reached));
    let analyzer = FnAnalyzer::new(move |_, _| {
        let (c, r) = (Arc::clone(&c), Arc::clone(&r));
        async move {
            if c.fetch_add(1, Ordering::SeqCst) == 2 {
                r.notify_one();
                std::future::pending::<()>().await;
            }
            Ok(Analysis::new("neutral", 0.8))
        }
    });
    let options = BulkOptions::default();
    let list = items(10);

    let run = orchestrator.run(&list, &analyzer, &options, |_| {});
    let abort = async {
        reached.notified().await;
        orchestrator.abort();
    };
    let (outcome, ()) = tokio::join!(run, abort);
    let outcome = outcome.unwrap();

    assert!(outcome.stats.aborted);
    assert_eq!(outcome.stats.total_processed, 2);
    assert_eq!(outcome.results.len() + outcome.errors.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(orchestrator.progress().state, RunState::Aborted);
}

/// Takes 10ms per item and counts calls.
#[derive(Debug, Default)]
struct SlowAnalyzer {
    calls: AtomicUsize,
}

impl SlowAnalyzer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyze for SlowAnalyzer {
    async fn analyze(&self, _provider: Provider, _item: &WorkItem) -> Result<Analysis, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(Analysis::new("neutral", 0.8))
    }
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_run_until_resumed() {
    let orchestrator = BulkOrchestrator::new(registry());
    let analyzer = SlowAnalyzer::default();
    let options = BulkOptions::default().with_providers(vec![Provider::Ollama]);
    let list = items(6);

    let run = orchestrator.run(&list, &analyzer, &options, |_| {});
    let steer = async {
        // items take 10ms each; the pause lands during the second one
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(orchestrator.pause());
        tokio::time::sleep(Duration::from_secs(60)).await;
        let seen = (analyzer.calls(), orchestrator.progress().state);
        assert!(orchestrator.resume());
        seen
    };
    let (outcome, (calls_while_paused, state_while_paused)) = tokio::join!(run, steer);
    let outcome = outcome.unwrap();

    assert_eq!(calls_while_paused, 2);
    assert_eq!(state_while_paused, RunState::Paused);
    assert_eq!(analyzer.calls(), 6);
    assert_eq!(outcome.stats.total_processed, 6);
    assert!(!outcome.stats.aborted);
    assert_eq!(orchestrator.progress().state, RunState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_paused_stops_run() {
    let orchestrator = BulkOrchestrator::new(registry());
    let analyzer = SlowAnalyzer::default();
    let options = BulkOptions::default().with_providers(vec![Provider::Ollama]);
    let list = items(6);

    let run = orchestrator.run(&list, &analyzer, &options, |_| {});
    let steer = async {
        tokio::time::sleep(Duration::from_millis(15)).await;
        orchestrator.pause();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(orchestrator.progress().state, RunState::Paused);
        assert!(orchestrator.abort());
    };
    let (outcome, ()) = tokio::join!(run, steer);
    let outcome = outcome.unwrap();

    assert!(outcome.stats.aborted);
    assert_eq!(outcome.stats.total_processed, 2);
    assert_eq!(analyzer.calls(), 2);
    assert_eq!(orchestrator.progress().state, RunState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_all_circuits_open_falls_back_to_offline_capable_providers() {
    let registry = registry();
    let orchestrator = BulkOrchestrator::new(Arc::clone(&registry));
    let analyzer = FnAnalyzer::new(|provider: Provider, _| async move {
        Err::<Analysis, _>(ProviderFailure::new(format!("{provider} returned 503")))
    });
    let options = BulkOptions::default()
        .with_pause_on_high_error_rate(false)
        .with_inter_batch_delay(Duration::ZERO)
        .with_providers(vec![Provider::HuggingFace, Provider::Ollama]);

    let outcome = orchestrator
        .run(&items(12), &analyzer, &options, |_| {})
        .await
        .unwrap();

    // the run keeps going on offline-capable providers even with both circuits open
    let stats = &outcome.stats;
    assert_eq!(stats.total_processed, 12);
    assert_eq!(stats.error_count, 12);
    assert!(stats.provider_switches.len() >= 2);
    assert!(stats
        .provider_switches
        .iter()
        .all(|s| s.from != s.to && s.to.is_offline_capable()));
    assert!(!registry.is_healthy(Provider::HuggingFace));
    assert!(!registry.is_healthy(Provider::Ollama));
}

#[tokio::test(start_paused = true)]
async fn test_high_error_rate_backs_off() {
    let orchestrator = BulkOrchestrator::new(registry());
    let analyzer = FnAnalyzer::new(|_, item: WorkItem| async move {
        if item.text == "ok" {
            Ok(Analysis::new("positive", 0.9))
        } else {
            Err(ProviderFailure::new("503 Service Unavailable"))
        }
    });
    let list: Vec<WorkItem> = ["ok", "fail", "fail", "ok", "fail", "fail"]
        .into_iter()
        .map(WorkItem::from)
        .collect();
    let options = BulkOptions::default()
        .with_adaptive_batching(false)
        .with_providers(vec![Provider::HuggingFace]);

    let started = Instant::now();
    let outcome = orchestrator
        .run(&list, &analyzer, &options, |_| {})
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(outcome.stats.processing_time_ms >= 5_000);
    assert_eq!(outcome.stats.total_processed, 6);
    assert_eq!(outcome.stats.error_count, 4);
    assert!(outcome.stats.provider_switches.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_disabled_runs_without_delay() {
    let orchestrator = BulkOrchestrator::new(registry());
    let analyzer = FnAnalyzer::new(|_, item: WorkItem| async move {
        if item.text == "ok" {
            Ok(Analysis::new("positive", 0.9))
        } else {
            Err(ProviderFailure::new("503 Service Unavailable"))
        }
    });
    let list: Vec<WorkItem> = ["ok", "fail", "fail"].into_iter().map(WorkItem::from).collect();
    let options = BulkOptions::default()
        .with_pause_on_high_error_rate(false)
        .with_providers(vec![Provider::HuggingFace]);

    let started = Instant::now();
    orchestrator
        .run(&list, &analyzer, &options, |_| {})
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
}
