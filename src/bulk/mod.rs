//! Bulk orchestration
//!
//! Runs an ordered list of [`WorkItem`](crate::analyzer::WorkItem)s through
//! the healthiest provider in adaptively sized batches, switching providers
//! when one keeps failing, and supporting pause, resume and abort.

mod control;
mod orchestrator;
mod stats;

pub use control::{ControlState, RunControl};
pub use orchestrator::BulkOrchestrator;
pub use stats::{BulkProgress, BulkStats, ProviderStats, ProviderSwitch, RunState, SwitchReason};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::analyzer::Analysis;
use crate::error::ClassifiedError;
use crate::provider::Provider;
use crate::selector::DEFAULT_SWITCH_THRESHOLD;

/// Largest batch adaptive batching grows to.
pub const MAX_BATCH_SIZE: usize = 10;

/// Batch error rate above which adaptive batching halves the batch.
pub const SHRINK_ERROR_RATE: f64 = 0.3;

/// Batch error rate below which adaptive batching may grow the batch.
pub const GROW_ERROR_RATE: f64 = 0.1;

/// Average response time below which adaptive batching may grow the batch.
pub const GROW_RESPONSE_TIME: Duration = Duration::from_secs(2);

/// Errors that end a bulk run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BulkError {
    #[error("no healthy providers available for bulk analysis")]
    NoProvidersAvailable,

    #[error("a bulk run is already in progress")]
    AlreadyRunning,
}

/// Tuning for one bulk run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOptions {
    /// Initial batch size.
    pub batch_size: usize,
    pub adaptive_batching: bool,
    pub pause_on_high_error_rate: bool,
    /// Batch error rate that triggers the high-error backoff.
    pub error_rate_threshold: f64,
    /// Recent errors on the current provider that trigger a switch.
    pub switch_provider_threshold: usize,
    /// Enabled providers in priority order.
    pub providers: Vec<Provider>,
    pub inter_batch_delay: Duration,
    pub high_error_backoff: Duration,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: 3,
            adaptive_batching: true,
            pause_on_high_error_rate: true,
            error_rate_threshold: 0.5,
            switch_provider_threshold: DEFAULT_SWITCH_THRESHOLD,
            providers: Provider::ALL.to_vec(),
            inter_batch_delay: Duration::from_millis(100),
            high_error_backoff: Duration::from_secs(5),
        }
    }
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_adaptive_batching(mut self, enabled: bool) -> Self {
        self.adaptive_batching = enabled;
        self
    }

    pub fn with_pause_on_high_error_rate(mut self, enabled: bool) -> Self {
        self.pause_on_high_error_rate = enabled;
        self
    }

    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_switch_provider_threshold(mut self, threshold: usize) -> Self {
        self.switch_provider_threshold = threshold;
        self
    }

    pub fn with_providers(mut self, providers: Vec<Provider>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn with_high_error_backoff(mut self, backoff: Duration) -> Self {
        self.high_error_backoff = backoff;
        self
    }
}

/// Computes the next batch size from the last batch's error rate and the
/// recent average response time.
pub fn adapt_batch_size(current: usize, error_rate: f64, average_response: Duration) -> usize {
    if error_rate > SHRINK_ERROR_RATE {
        return (current / 2).max(1);
    }
    if error_rate < GROW_ERROR_RATE && average_response < GROW_RESPONSE_TIME {
        return (current + 1).min(MAX_BATCH_SIZE);
    }
    current
}

/// A successfully analyzed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Position of the item in the input.
    pub index: usize,
    pub provider: Provider,
    pub analysis: Analysis,
    pub response_time_ms: u64,
}

/// An item that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Position of the item in the input.
    pub index: usize,
    pub error: ClassifiedError,
}

/// Everything a finished (or aborted) run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub results: Vec<ItemResult>,
    pub errors: Vec<ItemError>,
    pub stats: BulkStats,
}
