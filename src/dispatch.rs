//! Single-request failover.
//!
//! [`FailoverDispatcher`] sends one item to the best provider and follows
//! the classified recovery strategy on failure: retry in place with
//! exponential backoff, move to another provider, or give up when a person
//! has to step in.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::analyzer::{Analysis, Analyze, WorkItem};
use crate::error::{classify, create_error_summary, ClassifiedError, ProviderFailure, RecoveryStrategy};
use crate::provider::Provider;
use crate::selector::ProviderSelector;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by [`FailoverDispatcher::analyze`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no healthy providers available")]
    NoProvidersAvailable,

    #[error("{}", create_error_summary(.errors))]
    UserActionRequired { errors: Vec<ClassifiedError> },

    #[error("all providers failed: {}", create_error_summary(.errors))]
    Exhausted { errors: Vec<ClassifiedError> },
}

impl DispatchError {
    /// Every classified error encountered before giving up.
    pub fn errors(&self) -> &[ClassifiedError] {
        match self {
            DispatchError::NoProvidersAvailable => &[],
            DispatchError::UserActionRequired { errors } | DispatchError::Exhausted { errors } => {
                errors
            }
        }
    }
}

/// Exponential backoff for retrying the same provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Deterministic jitter applied to delays, in percent (0-100).
    pub jitter_percent: u8,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 2,
            jitter_percent: 0,
        }
    }
}

impl RetryStrategy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter_percent: 0,
        }
    }

    pub fn with_jitter_percent(mut self, percent: u8) -> Self {
        self.jitter_percent = percent.min(100);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `base_delay * 2^(attempt - 1)`, capped at `suggested` (when the
    /// error came with one) and at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_millis = self.base_delay.as_millis() as u64;
        let delay_millis = base_millis.saturating_mul(1u64 << exponent);

        let cap = suggested.map_or(self.max_delay, |s| s.min(self.max_delay));
        let capped_millis = delay_millis.min(cap.as_millis() as u64);

        let jitter_range = capped_millis as f64 * self.jitter_percent as f64 / 100.0;
        let jitter = deterministic_jitter(attempt, jitter_range);
        Duration::from_millis((capped_millis as i64 + jitter).max(0) as u64)
    }

    /// Returns true if another attempt on the same provider is allowed.
    ///
    /// `attempt` is the number of attempts already made.
    pub fn should_retry(&self, attempt: u32, error: &ClassifiedError) -> bool {
        error.retryable && attempt <= self.max_retries
    }
}

/// Alternates sign and scales with the attempt so tests stay reproducible.
fn deterministic_jitter(attempt: u32, range: f64) -> i64 {
    let sign = if attempt % 2 == 0 { 1.0 } else { -1.0 };
    let factor = ((attempt % 5) as f64 + 1.0) / 5.0;
    (range * sign * factor) as i64
}

/// A successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub provider: Provider,
    pub analysis: Analysis,
    /// Calls made across all providers, including the successful one.
    pub attempts: u32,
    pub response_time: Duration,
    /// Failures recovered from along the way.
    pub errors: Vec<ClassifiedError>,
}

/// Sends single items through the provider pool with failover.
#[derive(Debug, Clone)]
pub struct FailoverDispatcher {
    selector: ProviderSelector,
    providers: Vec<Provider>,
    timeout: Duration,
    retry: RetryStrategy,
}

impl FailoverDispatcher {
    /// Creates a dispatcher over `providers` in priority order.
    pub fn new(selector: ProviderSelector, providers: Vec<Provider>) -> Self {
        Self {
            selector,
            providers,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryStrategy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_strategy(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry
    }

    /// Analyzes one item, failing over between providers as needed.
    pub async fn analyze<A>(&self, analyzer: &A, item: &WorkItem) -> Result<Dispatched, DispatchError>
    where
        A: Analyze + ?Sized,
    {
        let registry = self.selector.registry();
        let mut remaining = self.providers.clone();
        let mut errors: Vec<ClassifiedError> = Vec::new();
        let mut calls = 0u32;

        let mut current = self
            .selector
            .select(&remaining)
            .ok_or(DispatchError::NoProvidersAvailable)?;

        loop {
            let mut attempt = 0u32;
            let strategy = loop {
                attempt += 1;
                calls += 1;

                let started = Instant::now();
                let result = match tokio::time::timeout(self.timeout, analyzer.analyze(current, item)).await {
                    Ok(result) => result,
                    Err(elapsed) => Err(ProviderFailure::from(elapsed)),
                };
                let response_time = started.elapsed();

                let failure = match result {
                    Ok(analysis) => {
                        registry.record_success(current, response_time);
                        debug!(provider = %current, calls, "dispatch succeeded");
                        return Ok(Dispatched {
                            provider: current,
                            analysis,
                            attempts: calls,
                            response_time,
                            errors,
                        });
                    }
                    Err(failure) => failure,
                };

                let error = classify(&failure, current);
                registry.record_failure(current, &error);
                let strategy = error.recovery_strategy;
                let suggested = error.retry_delay();
                let needs_user = error.requires_user_action();
                let retry = !needs_user
                    && !error.should_switch_provider()
                    && self.retry.should_retry(attempt, &error)
                    && registry.is_healthy(current);
                errors.push(error);

                if needs_user {
                    warn!(provider = %current, "provider needs user action");
                    return Err(DispatchError::UserActionRequired { errors });
                }
                if !retry {
                    break strategy;
                }

                let delay = self.retry.calculate_delay(attempt, suggested);
                debug!(
                    provider = %current,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying same provider"
                );
                tokio::time::sleep(delay).await;
            };

            remaining.retain(|p| *p != current);
            let next = if strategy == RecoveryStrategy::FallbackLocal {
                let local: Vec<Provider> = remaining
                    .iter()
                    .copied()
                    .filter(|p| p.is_offline_capable())
                    .collect();
                self.selector
                    .registry()
                    .best_provider(&local)
                    .or_else(|| self.selector.select(&remaining))
            } else {
                self.selector.select(&remaining)
            };

            let Some(next) = next else {
                warn!(attempts = calls, "all providers failed");
                return Err(DispatchError::Exhausted { errors });
            };
            info!(from = %current, to = %next, strategy = ?strategy, "failing over");
            current = next;
        }
    }
}
