//! The bulk run loop.

use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::stats::estimate_remaining;
use super::{
    adapt_batch_size, BulkError, BulkOptions, BulkOutcome, BulkProgress, BulkStats, ItemError,
    ItemResult, ProviderStats, ProviderSwitch, RunControl, RunState, SwitchReason,
};
use crate::analyzer::{Analyze, WorkItem};
use crate::error::{classify, ClassifiedError, ProviderFailure};
use crate::health::HealthRegistry;
use crate::provider::Provider;
use crate::selector::{ProviderSelector, RECENT_ERROR_WINDOW};

/// Number of recent item response times averaged for adaptive batching.
const RESPONSE_TIME_WINDOW: usize = 10;

/// Runs bulk work against the provider pool.
///
/// One orchestrator runs one bulk job at a time; [`pause`](Self::pause),
/// [`resume`](Self::resume) and [`abort`](Self::abort) may be called from
/// other tasks while [`run`](Self::run) is in progress.
#[derive(Debug)]
pub struct BulkOrchestrator {
    selector: ProviderSelector,
    control: RunControl,
    progress: Arc<RwLock<BulkProgress>>,
    running: AtomicBool,
}

/// Items processed by one batch.
#[derive(Debug, Default)]
struct BatchOutcome {
    results: Vec<ItemResult>,
    errors: Vec<ItemError>,
    response_times: Vec<Duration>,
    aborted: bool,
}

impl BatchOutcome {
    fn processed(&self) -> usize {
        self.results.len() + self.errors.len()
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl BulkOrchestrator {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self::with_selector(ProviderSelector::new(registry))
    }

    pub fn with_selector(selector: ProviderSelector) -> Self {
        Self {
            selector,
            control: RunControl::new(),
            progress: Arc::new(RwLock::new(BulkProgress::default())),
            running: AtomicBool::new(false),
        }
    }

    /// Handle for steering the run from another task.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Requests a pause at the next item boundary.
    pub fn pause(&self) -> bool {
        self.control.request_pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    /// Aborts the run, dropping the in-flight call.
    pub fn abort(&self) -> bool {
        self.control.abort()
    }

    /// Latest progress snapshot. Stays readable after the run ends.
    pub fn progress(&self) -> BulkProgress {
        self.progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Processes `items` in order.
    ///
    /// Item failures are collected into the outcome, not returned as errors.
    /// An abort returns `Ok` with the partial outcome and
    /// [`BulkStats::aborted`] set. Fails only if no provider can be used or
    /// another run is in progress.
    pub async fn run<A, F>(
        &self,
        items: &[WorkItem],
        analyzer: &A,
        options: &BulkOptions,
        mut on_progress: F,
    ) -> Result<BulkOutcome, BulkError>
    where
        A: Analyze + ?Sized,
        F: FnMut(&BulkProgress) + Send,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BulkError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        self.control.reset();

        let started = Instant::now();
        let total = items.len();
        let enabled = options.providers.as_slice();
        let mut batch_size = options.batch_size.max(1);

        self.set_progress(BulkProgress {
            state: RunState::Running,
            total,
            batch_size,
            ..BulkProgress::default()
        });

        let mut provider = if items.is_empty() {
            None
        } else {
            match self.selector.select(enabled) {
                Some(p) => Some(p),
                None => return Err(self.fail(BulkError::NoProvidersAvailable)),
            }
        };

        info!(items = total, provider = ?provider, batch_size, "bulk run started");

        let mut results: Vec<ItemResult> = Vec::with_capacity(total);
        let mut errors: Vec<ItemError> = Vec::new();
        let mut provider_stats: BTreeMap<Provider, ProviderStats> = BTreeMap::new();
        let mut switches: Vec<ProviderSwitch> = Vec::new();
        let mut recent_times: VecDeque<Duration> = VecDeque::with_capacity(RESPONSE_TIME_WINDOW);
        let mut cursor = 0;
        let mut aborted = false;

        while let Some(mut current) = provider.filter(|_| cursor < total) {
            if self.control.is_aborted() {
                aborted = true;
                break;
            }

            let recent: Vec<ClassifiedError> = errors
                .iter()
                .skip(errors.len().saturating_sub(RECENT_ERROR_WINDOW))
                .map(|e| e.error.clone())
                .collect();
            if ProviderSelector::should_switch(current, &recent, options.switch_provider_threshold) {
                current = self.switch_provider(
                    enabled,
                    current,
                    cursor,
                    SwitchReason::RepeatedErrors,
                    &mut switches,
                )?;
            }

            if !self.selector.registry().is_healthy(current) {
                current = self.switch_provider(
                    enabled,
                    current,
                    cursor,
                    SwitchReason::Unhealthy,
                    &mut switches,
                )?;
            }
            provider = Some(current);

            let end = (cursor + batch_size).min(total);
            let batch = &items[cursor..end];
            let batch_len = batch.len();

            let outcome = match AssertUnwindSafe(self.process_batch(batch, cursor, current, analyzer))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => self.fail_batch(batch_len, cursor, current, panic),
            };

            for result in &outcome.results {
                provider_stats
                    .entry(result.provider)
                    .or_default()
                    .record_success(Duration::from_millis(result.response_time_ms));
            }
            for error in &outcome.errors {
                provider_stats.entry(error.error.provider).or_default().record_failure();
            }
            for time in &outcome.response_times {
                if recent_times.len() == RESPONSE_TIME_WINDOW {
                    recent_times.pop_front();
                }
                recent_times.push_back(*time);
            }

            let processed = outcome.processed();
            let batch_errors = outcome.errors.len();
            cursor += processed;
            results.extend(outcome.results);
            errors.extend(outcome.errors);

            if outcome.aborted {
                aborted = true;
                break;
            }

            let error_rate = if processed == 0 {
                0.0
            } else {
                batch_errors as f64 / processed as f64
            };

            if options.adaptive_batching {
                let average = average_duration(&recent_times);
                let next = adapt_batch_size(batch_size, error_rate, average);
                if next != batch_size {
                    debug!(from = batch_size, to = next, error_rate, "adapted batch size");
                }
                batch_size = next;
            }

            let snapshot = self.update_progress(|p| {
                p.state = RunState::Running;
                p.processed = results.len() + errors.len();
                p.success_count = results.len();
                p.error_count = errors.len();
                p.current_provider = Some(current);
                p.batch_size = batch_size;
                p.eta_ms = estimate_remaining(p.processed, total, started.elapsed())
                    .map(|d| d.as_millis() as u64);
            });
            on_progress(&snapshot);

            if options.pause_on_high_error_rate && error_rate > options.error_rate_threshold {
                warn!(
                    errors = batch_errors,
                    batch = processed,
                    backoff_ms = options.high_error_backoff.as_millis() as u64,
                    "high error rate, backing off"
                );
                if !self.sleep_unless_aborted(options.high_error_backoff).await {
                    aborted = true;
                    break;
                }
            }

            if cursor < total && !self.sleep_unless_aborted(options.inter_batch_delay).await {
                aborted = true;
                break;
            }
        }

        let elapsed = started.elapsed();
        let stats = BulkStats::compute(&results, &errors, elapsed, provider_stats, switches, aborted);

        let final_state = if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        let snapshot = self.update_progress(|p| {
            p.state = final_state;
            p.processed = stats.total_processed;
            p.success_count = stats.success_count;
            p.error_count = stats.error_count;
            p.current_provider = provider;
            p.eta_ms = if aborted { None } else { Some(0) };
        });
        if aborted {
            info!(processed = snapshot.processed, total, "bulk run aborted");
        } else {
            info!(
                processed = stats.total_processed,
                errors = stats.error_count,
                elapsed_ms = stats.processing_time_ms,
                "bulk run completed"
            );
        }

        Ok(BulkOutcome {
            results,
            errors,
            stats,
        })
    }

    /// Analyzes one batch sequentially on `provider`.
    async fn process_batch<A>(
        &self,
        batch: &[WorkItem],
        offset: usize,
        provider: Provider,
        analyzer: &A,
    ) -> BatchOutcome
    where
        A: Analyze + ?Sized,
    {
        let registry = self.selector.registry();
        let mut outcome = BatchOutcome::default();

        for (i, item) in batch.iter().enumerate() {
            let index = offset + i;

            if self.control.is_paused() {
                self.update_progress(|p| p.state = RunState::Paused);
                let resumed = self.control.checkpoint().await;
                self.update_progress(|p| p.state = RunState::Running);
                if !resumed {
                    outcome.aborted = true;
                    return outcome;
                }
            }

            let item_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.control.cancelled() => {
                    debug!(index, provider = %provider, "dropping in-flight call");
                    outcome.aborted = true;
                    return outcome;
                }
                result = analyzer.analyze(provider, item) => result,
            };
            let response_time = item_started.elapsed();
            outcome.response_times.push(response_time);

            match result {
                Ok(analysis) => {
                    registry.record_success(provider, response_time);
                    debug!(index, provider = %provider, label = %analysis.label, "item analyzed");
                    outcome.results.push(ItemResult {
                        index,
                        provider,
                        analysis,
                        response_time_ms: response_time.as_millis() as u64,
                    });
                }
                Err(failure) => {
                    let error = classify(&failure, provider);
                    registry.record_failure(provider, &error);
                    debug!(index, provider = %provider, kind = %error.kind, "item failed");
                    outcome.errors.push(ItemError { index, error });
                }
            }
        }

        outcome
    }

    /// Attributes a batch-level failure to every item of the batch.
    fn fail_batch(
        &self,
        batch_len: usize,
        offset: usize,
        provider: Provider,
        panic: Box<dyn Any + Send>,
    ) -> BatchOutcome {
        let failure = ProviderFailure::new(format!("batch failed: {}", panic_message(&*panic)));
        warn!(provider = %provider, offset, error = %failure, "batch processing failed");

        let registry = self.selector.registry();
        let errors = (offset..offset + batch_len)
            .map(|index| {
                let error = classify(&failure, provider);
                registry.record_failure(provider, &error);
                ItemError { index, error }
            })
            .collect();

        BatchOutcome {
            errors,
            ..BatchOutcome::default()
        }
    }

    fn switch_provider(
        &self,
        enabled: &[Provider],
        from: Provider,
        at_item: usize,
        reason: SwitchReason,
        switches: &mut Vec<ProviderSwitch>,
    ) -> Result<Provider, BulkError> {
        let Some(to) = self.selector.select_excluding(enabled, from) else {
            warn!(from = %from, reason = ?reason, "no alternative provider available");
            return Err(self.fail(BulkError::NoProvidersAvailable));
        };
        if !self.selector.registry().is_healthy(to) {
            warn!(
                from = %from,
                to = %to,
                "no healthy provider left, falling back to an unhealthy offline-capable one"
            );
        }
        info!(from = %from, to = %to, reason = ?reason, at_item, "switching provider");
        switches.push(ProviderSwitch {
            from,
            to,
            at_item,
            reason,
        });
        Ok(to)
    }

    /// Sleeps for `duration`; returns false if aborted meanwhile.
    async fn sleep_unless_aborted(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.control.is_aborted();
        }
        tokio::select! {
            biased;
            _ = self.control.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn fail(&self, error: BulkError) -> BulkError {
        self.update_progress(|p| p.state = RunState::Failed);
        error
    }

    fn set_progress(&self, progress: BulkProgress) {
        *self.progress.write().unwrap_or_else(PoisonError::into_inner) = progress;
    }

    fn update_progress(&self, f: impl FnOnce(&mut BulkProgress)) -> BulkProgress {
        let mut progress = self.progress.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut progress);
        progress.clone()
    }
}

fn average_duration(times: &VecDeque<Duration>) -> Duration {
    if times.is_empty() {
        return Duration::ZERO;
    }
    times.iter().sum::<Duration>() / times.len() as u32
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analysis, FnAnalyzer};
    use crate::error::ErrorKind;
    use crate::health::CircuitBreakerConfig;

    fn orchestrator() -> BulkOrchestrator {
        BulkOrchestrator::new(Arc::new(HealthRegistry::new(CircuitBreakerConfig::default())))
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n).map(|i| WorkItem::new(format!("message {i}"))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_items_succeed() {
        let orchestrator = orchestrator();
        let analyzer = FnAnalyzer::new(|_, _| async { Ok(Analysis::new("joy", 0.9)) });
        let mut callbacks = 0;

        let outcome = orchestrator
            .run(&items(7), &analyzer, &BulkOptions::default(), |p| {
                callbacks += 1;
                assert_eq!(p.success_count + p.error_count, p.processed);
            })
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 7);
        assert_eq!(outcome.stats.total_processed, 7);
        assert_eq!(outcome.stats.label_distribution["joy"], 7);
        assert!(!outcome.stats.aborted);
        // batches grow 3, 4
        assert_eq!(callbacks, 2);
        assert_eq!(orchestrator.progress().state, RunState::Completed);
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let orchestrator = orchestrator();
        let analyzer = FnAnalyzer::new(|_, _| async { Ok(Analysis::new("joy", 0.9)) });
        let outcome = orchestrator
            .run(&[], &analyzer, &BulkOptions::default(), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.stats.total_processed, 0);
    }

    #[tokio::test]
    async fn test_no_providers_is_fatal() {
        let orchestrator = orchestrator();
        let analyzer = FnAnalyzer::new(|_, _| async { Ok(Analysis::new("joy", 0.9)) });
        let options = BulkOptions::default().with_providers(vec![]);
        let err = orchestrator
            .run(&items(2), &analyzer, &options, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, BulkError::NoProvidersAvailable);
        assert_eq!(orchestrator.progress().state, RunState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_batch_fails_every_item() {
        let orchestrator = orchestrator();
        let analyzer = FnAnalyzer::new(|_, item: WorkItem| async move {
            if item.text == "message 1" {
                panic!("analyzer exploded");
            }
            Ok(Analysis::new("joy", 0.9))
        });
        let options = BulkOptions::default()
            .with_adaptive_batching(false)
            .with_pause_on_high_error_rate(false)
            .with_providers(vec![Provider::HuggingFace, Provider::Ollama]);

        let outcome = orchestrator
            .run(&items(6), &analyzer, &options, |_| {})
            .await
            .unwrap();

        // first batch (items 0..3) is lost as a whole
        assert_eq!(outcome.errors.len(), 3);
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome
            .errors
            .iter()
            .all(|e| e.error.technical_message.contains("analyzer exploded")));
        assert_eq!(outcome.stats.error_summary[&ErrorKind::Unknown], 3);
        assert_eq!(
            outcome.errors.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_rejects_concurrent_run() {
        let orchestrator = orchestrator();
        let gate = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(tokio::sync::Notify::new());
        let (g, s) = (Arc::clone(&gate), Arc::clone(&started));
        let analyzer = FnAnalyzer::new(move |_, _| {
            let (g, s) = (Arc::clone(&g), Arc::clone(&s));
            async move {
                s.notify_one();
                g.notified().await;
                Ok(Analysis::new("joy", 0.9))
            }
        });
        let options = BulkOptions::default();
        let list = items(1);

        let first = orchestrator.run(&list, &analyzer, &options, |_| {});
        let second = async {
            started.notified().await;
            let err = orchestrator
                .run(&list, &analyzer, &options, |_| {})
                .await
                .unwrap_err();
            gate.notify_one();
            err
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert_eq!(second, BulkError::AlreadyRunning);
    }
}
