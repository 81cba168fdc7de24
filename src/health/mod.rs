//! Provider health tracking and circuit breaking
//!
//! The [`HealthRegistry`] keeps one [`ProviderHealth`] per known provider and
//! updates it from success and failure events. After
//! [`CircuitBreakerConfig::failure_threshold`] consecutive failures the
//! provider's circuit opens for the cool-down period; a periodic sweep (see
//! [`HealthSweeper`]) moves expired circuits to half-open.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(cool-down elapsed, sweep)--> HALF-OPEN
//!    ^                                  ^                                    |
//!    +------------ success -------------+------------- failure --------------+
//! ```

mod sweeper;

pub use sweeper::HealthSweeper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ClassifiedError, ErrorKind};
use crate::provider::Provider;

/// Weight of the previous average when folding in a new response time.
const EMA_KEEP: f64 = 0.8;

/// Weight of the newest sample.
const EMA_NEW: f64 = 0.2;

/// Capacity of the health event channel.
const EVENT_CAPACITY: usize = 64;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an opened circuit stays open.
    pub cooldown: Duration,
    /// How often the sweeper checks for expired circuits.
    pub sweep_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold (minimum 1).
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the cool-down period.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Sets the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Health record for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Exponential moving average of successful response times.
    pub average_response_time_ms: f64,
    /// Number of successful responses folded into the average.
    pub response_samples: u64,
    pub circuit_open: bool,
    pub circuit_open_until: Option<DateTime<Utc>>,
    /// Set by the sweep when an expired circuit is let through again.
    pub half_open: bool,
    /// Kind of the most recent failure.
    pub last_error: Option<ErrorKind>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            average_response_time_ms: 0.0,
            response_samples: 0,
            circuit_open: false,
            circuit_open_until: None,
            half_open: false,
            last_error: None,
        }
    }
}

impl ProviderHealth {
    /// Circuit breaker state derived from the record.
    pub fn circuit_state(&self) -> CircuitState {
        if self.circuit_open {
            CircuitState::Open
        } else if self.half_open {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    fn record_response_time(&mut self, response_time: Duration) {
        let sample = response_time.as_secs_f64() * 1000.0;
        self.average_response_time_ms = if self.response_samples == 0 {
            sample
        } else {
            self.average_response_time_ms * EMA_KEEP + sample * EMA_NEW
        };
        self.response_samples += 1;
    }

    fn close_circuit(&mut self) {
        self.circuit_open = false;
        self.circuit_open_until = None;
    }
}

/// Circuit breaker state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are refused until the cool-down elapses.
    Open,
    /// Cool-down elapsed; the next result decides.
    HalfOpen,
}

/// What caused a health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTransition {
    Success,
    Failure,
    CircuitOpened,
    HalfOpened,
    NetworkRecovered,
    Reset,
}

/// Emitted on every health mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEvent {
    pub provider: Provider,
    /// Snapshot taken right after the mutation.
    pub health: ProviderHealth,
    pub transition: HealthTransition,
}

/// Shared per-provider health state.
///
/// Mutations are serialized under one lock; every read returns a snapshot.
#[derive(Debug)]
pub struct HealthRegistry {
    config: CircuitBreakerConfig,
    state: RwLock<HashMap<Provider, ProviderHealth>>,
    online: AtomicBool,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<HealthEvent>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl HealthRegistry {
    /// Creates a registry using the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a registry reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            state: RwLock::new(initial_state()),
            online: AtomicBool::new(true),
            clock,
            events,
        }
    }

    /// Returns the circuit breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribes to health events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Updates the connectivity flag consulted for network-dependent
    /// providers. Driven by the network monitor.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns the connectivity flag.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records a successful call: closes the circuit and resets failures.
    pub fn record_success(&self, provider: Provider, response_time: Duration) -> ProviderHealth {
        let now = self.clock.now();
        let snapshot = self.mutate(provider, |health| {
            health.healthy = true;
            health.consecutive_failures = 0;
            health.last_success_at = Some(now);
            health.half_open = false;
            health.close_circuit();
            health.record_response_time(response_time);
        });

        debug!(
            provider = %provider,
            response_ms = response_time.as_millis() as u64,
            average_ms = snapshot.average_response_time_ms,
            "recorded success"
        );
        self.emit(provider, &snapshot, HealthTransition::Success);
        snapshot
    }

    /// Records a failed call; opens the circuit at the threshold.
    pub fn record_failure(&self, provider: Provider, error: &ClassifiedError) -> ProviderHealth {
        let now = self.clock.now();
        let threshold = self.config.failure_threshold;
        let open_until = deadline(now, self.config.cooldown);
        let mut opened = false;

        let snapshot = self.mutate(provider, |health| {
            health.consecutive_failures += 1;
            health.last_failure_at = Some(now);
            health.last_error = Some(error.kind);
            if health.consecutive_failures >= threshold {
                opened = !health.circuit_open;
                health.circuit_open = true;
                health.circuit_open_until = Some(open_until);
                health.healthy = false;
                health.half_open = false;
            }
        });

        let transition = if opened {
            warn!(
                provider = %provider,
                failures = snapshot.consecutive_failures,
                until = %open_until,
                "circuit breaker opened"
            );
            HealthTransition::CircuitOpened
        } else {
            debug!(
                provider = %provider,
                kind = %error.kind,
                failures = snapshot.consecutive_failures,
                "recorded failure"
            );
            HealthTransition::Failure
        };
        self.emit(provider, &snapshot, transition);
        snapshot
    }

    /// Returns true if `provider` may be used right now.
    ///
    /// Reads stored state only: an open circuit whose cool-down has elapsed
    /// stays unhealthy until the sweep moves it to half-open.
    pub fn is_healthy(&self, provider: Provider) -> bool {
        let state = self.read();
        self.is_healthy_in(&state, provider)
    }

    fn is_healthy_in(&self, state: &HashMap<Provider, ProviderHealth>, provider: Provider) -> bool {
        let Some(health) = state.get(&provider) else {
            return false;
        };
        if health.circuit_open {
            return false;
        }
        if provider.is_network_dependent() && !self.is_online() {
            return false;
        }
        health.healthy
    }

    /// Picks the healthy candidate with the lowest average response time.
    ///
    /// Ties go to the earlier candidate. When offline, offline-capable
    /// providers are preferred. Returns `None` if no candidate is healthy.
    pub fn best_provider(&self, candidates: &[Provider]) -> Option<Provider> {
        let state = self.read();
        let healthy: Vec<Provider> = candidates
            .iter()
            .copied()
            .filter(|p| self.is_healthy_in(&state, *p))
            .collect();

        if healthy.is_empty() {
            return None;
        }

        let pool = if self.is_online() {
            healthy
        } else {
            let offline: Vec<Provider> = healthy
                .iter()
                .copied()
                .filter(|p| p.is_offline_capable())
                .collect();
            if offline.is_empty() {
                healthy
            } else {
                offline
            }
        };

        let average = |p: &Provider| {
            state
                .get(p)
                .map(|h| h.average_response_time_ms)
                .unwrap_or(f64::MAX)
        };

        let mut best = pool[0];
        for candidate in pool.iter().skip(1) {
            if average(candidate) < average(&best) {
                best = *candidate;
            }
        }
        Some(best)
    }

    /// Moves circuits whose cool-down has elapsed to half-open.
    ///
    /// Returns the providers that changed.
    pub fn sweep(&self) -> Vec<Provider> {
        let now = self.clock.now();
        let mut changed = Vec::new();
        {
            let mut state = self.write();
            for provider in Provider::ALL {
                let Some(health) = state.get_mut(&provider) else {
                    continue;
                };
                let expired = health.circuit_open
                    && health.circuit_open_until.is_some_and(|until| now >= until);
                if expired {
                    health.close_circuit();
                    health.consecutive_failures = health.consecutive_failures.saturating_sub(1);
                    health.healthy = true;
                    health.half_open = true;
                    changed.push((provider, health.clone()));
                }
            }
        }

        for (provider, snapshot) in &changed {
            info!(provider = %provider, "circuit breaker moved to half-open");
            self.emit(*provider, snapshot, HealthTransition::HalfOpened);
        }
        changed.into_iter().map(|(p, _)| p).collect()
    }

    /// Force-closes the circuits of every network-dependent provider and
    /// zeroes their failures. Called when connectivity returns.
    pub fn recover_network_providers(&self) {
        let mut changed = Vec::new();
        {
            let mut state = self.write();
            for provider in Provider::ALL.into_iter().filter(|p| p.is_network_dependent()) {
                let health = state.entry(provider).or_default();
                let before = health.clone();
                health.close_circuit();
                health.consecutive_failures = 0;
                health.healthy = true;
                health.half_open = false;
                if *health != before {
                    changed.push((provider, health.clone()));
                }
            }
        }

        for (provider, snapshot) in &changed {
            info!(provider = %provider, "reset circuit breaker after network recovery");
            self.emit(*provider, snapshot, HealthTransition::NetworkRecovered);
        }
    }

    /// Returns every provider to the default healthy state.
    pub fn reset_all(&self) {
        {
            let mut state = self.write();
            *state = initial_state();
        }
        info!("reset all provider health");
        for provider in Provider::ALL {
            self.emit(provider, &ProviderHealth::default(), HealthTransition::Reset);
        }
    }

    /// Snapshot of one provider's health.
    pub fn health(&self, provider: Provider) -> ProviderHealth {
        self.read().get(&provider).cloned().unwrap_or_default()
    }

    /// Snapshot of every provider's health, in declaration order.
    pub fn all_health(&self) -> Vec<(Provider, ProviderHealth)> {
        let state = self.read();
        Provider::ALL
            .into_iter()
            .map(|p| (p, state.get(&p).cloned().unwrap_or_default()))
            .collect()
    }

    /// Providers currently usable, in declaration order.
    pub fn healthy_providers(&self) -> Vec<Provider> {
        let state = self.read();
        Provider::ALL
            .into_iter()
            .filter(|p| self.is_healthy_in(&state, *p))
            .collect()
    }

    /// Providers that keep working without connectivity.
    pub fn offline_capable_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| p.is_offline_capable())
            .collect()
    }

    /// Circuit breaker state of one provider.
    pub fn circuit_state(&self, provider: Provider) -> CircuitState {
        self.health(provider).circuit_state()
    }

    fn mutate(&self, provider: Provider, f: impl FnOnce(&mut ProviderHealth)) -> ProviderHealth {
        let mut state = self.write();
        let health = state.entry(provider).or_default();
        f(health);
        health.clone()
    }

    fn emit(&self, provider: Provider, health: &ProviderHealth, transition: HealthTransition) {
        // No receivers is not an error
        let _ = self.events.send(HealthEvent {
            provider,
            health: health.clone(),
            transition,
        });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Provider, ProviderHealth>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Provider, ProviderHealth>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn initial_state() -> HashMap<Provider, ProviderHealth> {
    Provider::ALL
        .into_iter()
        .map(|p| (p, ProviderHealth::default()))
        .collect()
}

fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
