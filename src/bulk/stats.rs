//! Bulk run statistics and progress snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{ItemError, ItemResult};
use crate::error::ErrorKind;
use crate::provider::Provider;

/// Lifecycle of a bulk run as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
}

/// Progress snapshot, updated after every batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkProgress {
    pub state: RunState,
    /// Items accounted for so far (successes + errors).
    pub processed: usize,
    pub total: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub current_provider: Option<Provider>,
    pub batch_size: usize,
    /// Linear estimate of the remaining time, in milliseconds.
    pub eta_ms: Option<u64>,
}

impl BulkProgress {
    /// Completion in percent.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 / self.total as f64 * 100.0
    }

    /// Remaining time estimate.
    pub fn eta(&self) -> Option<Duration> {
        self.eta_ms.map(Duration::from_millis)
    }
}

/// Estimates the remaining time assuming the rate so far holds.
pub(crate) fn estimate_remaining(processed: usize, total: usize, elapsed: Duration) -> Option<Duration> {
    if processed == 0 {
        return None;
    }
    let per_item = elapsed.as_secs_f64() / processed as f64;
    let remaining = total.saturating_sub(processed) as f64;
    Some(Duration::from_secs_f64(per_item * remaining))
}

/// Counters for one provider within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    /// Mean response time of successful calls.
    pub average_response_time_ms: f64,
}

impl ProviderStats {
    pub(crate) fn record_success(&mut self, response_time: Duration) {
        let sample = response_time.as_secs_f64() * 1000.0;
        self.attempts += 1;
        self.successes += 1;
        self.average_response_time_ms +=
            (sample - self.average_response_time_ms) / self.successes as f64;
    }

    pub(crate) fn record_failure(&mut self) {
        self.attempts += 1;
        self.failures += 1;
    }
}

/// Why the run moved to another provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// Too many of the recent errors came from the provider.
    RepeatedErrors,
    /// The provider's circuit is open or it is otherwise unusable.
    Unhealthy,
}

/// A provider change made during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSwitch {
    pub from: Provider,
    pub to: Provider,
    /// Index of the first item sent to the new provider.
    pub at_item: usize,
    pub reason: SwitchReason,
}

/// Final statistics of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkStats {
    pub total_processed: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub average_confidence: f64,
    pub label_distribution: BTreeMap<String, usize>,
    pub processing_time_ms: u64,
    /// Error counts by kind.
    pub error_summary: BTreeMap<ErrorKind, usize>,
    pub provider_stats: BTreeMap<Provider, ProviderStats>,
    pub provider_switches: Vec<ProviderSwitch>,
    pub aborted: bool,
}

impl BulkStats {
    pub(crate) fn compute(
        results: &[ItemResult],
        errors: &[ItemError],
        elapsed: Duration,
        provider_stats: BTreeMap<Provider, ProviderStats>,
        provider_switches: Vec<ProviderSwitch>,
        aborted: bool,
    ) -> Self {
        let average_confidence = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.analysis.confidence).sum::<f64>() / results.len() as f64
        };

        let mut label_distribution = BTreeMap::new();
        for result in results {
            *label_distribution
                .entry(result.analysis.label.clone())
                .or_insert(0) += 1;
        }

        let mut error_summary = BTreeMap::new();
        for error in errors {
            *error_summary.entry(error.error.kind).or_insert(0) += 1;
        }

        Self {
            total_processed: results.len() + errors.len(),
            success_count: results.len(),
            error_count: errors.len(),
            average_confidence,
            label_distribution,
            processing_time_ms: elapsed.as_millis() as u64,
            error_summary,
            provider_stats,
            provider_switches,
            aborted,
        }
    }

    /// Fraction of processed items that failed.
    pub fn error_rate(&self) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_processed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analysis;
    use crate::error::{classify, ProviderFailure};

    fn result(index: usize, label: &str, confidence: f64) -> ItemResult {
        ItemResult {
            index,
            provider: Provider::Ollama,
            analysis: Analysis::new(label, confidence),
            response_time_ms: 10,
        }
    }

    #[test]
    fn test_progress_percent_and_eta() {
        let progress = BulkProgress {
            processed: 3,
            total: 12,
            eta_ms: Some(4_500),
            ..BulkProgress::default()
        };
        assert!((progress.percent() - 25.0).abs() < 1e-9);
        assert_eq!(progress.eta(), Some(Duration::from_millis(4_500)));

        let empty = BulkProgress::default();
        assert_eq!(empty.percent(), 100.0);
        assert_eq!(empty.eta(), None);
    }

    #[test]
    fn test_compute_stats() {
        let results = vec![
            result(0, "joy", 0.8),
            result(1, "joy", 0.6),
            result(2, "anger", 0.4),
        ];
        let errors = vec![ItemError {
            index: 3,
            error: classify(&ProviderFailure::new("429"), Provider::Gemini),
        }];

        let stats = BulkStats::compute(
            &results,
            &errors,
            Duration::from_millis(1500),
            BTreeMap::new(),
            Vec::new(),
            false,
        );
        assert_eq!(stats.total_processed, 4);
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.error_count, 1);
        assert!((stats.average_confidence - 0.6).abs() < 1e-9);
        assert_eq!(stats.label_distribution["joy"], 2);
        assert_eq!(stats.error_summary[&ErrorKind::RateLimit], 1);
        assert_eq!(stats.processing_time_ms, 1500);
        assert!((stats.error_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_provider_stats_mean() {
        let mut stats = ProviderStats::default();
        stats.record_success(Duration::from_millis(100));
        stats.record_success(Duration::from_millis(300));
        stats.record_failure();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.failures, 1);
        assert!((stats.average_response_time_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_remaining() {
        assert_eq!(estimate_remaining(0, 10, Duration::from_secs(5)), None);
        assert_eq!(
            estimate_remaining(5, 10, Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_stats_serialize_map_keys() {
        let mut stats = BulkStats::default();
        stats.error_summary.insert(ErrorKind::ServerError, 2);
        stats
            .provider_stats
            .insert(Provider::SentimentApi, ProviderStats::default());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["error_summary"]["server_error"], 2);
        assert!(json["provider_stats"]["sentiment-api"].is_object());
    }
}
