//! Background circuit sweep.
//!
//! Runs [`HealthRegistry::sweep`] on a fixed interval so expired circuits
//! move to half-open without a caller having to ask.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use super::HealthRegistry;

/// Periodic sweeper bound to one registry.
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(HealthRegistry::default());
/// let sweeper = HealthSweeper::new(Arc::clone(&registry));
/// sweeper.start().await;
/// // ...
/// sweeper.stop().await;
/// ```
#[derive(Debug)]
pub struct HealthSweeper {
    registry: Arc<HealthRegistry>,
    interval: Duration,
    /// Flag to signal the background task to stop.
    stop_flag: Arc<AtomicBool>,
    /// Handle to the background task.
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthSweeper {
    /// Creates a sweeper using the registry's configured interval.
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        let interval = registry.config().sweep_interval;
        Self::with_interval(registry, interval)
    }

    /// Creates a sweeper with an explicit interval.
    pub fn with_interval(registry: Arc<HealthRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            stop_flag: Arc::new(AtomicBool::new(false)),
            task_handle: Mutex::new(None),
        }
    }

    /// Starts the background task. Restarts it if already running.
    pub async fn start(&self) {
        self.stop().await;
        self.stop_flag.store(false, Ordering::SeqCst);

        let registry = Arc::clone(&self.registry);
        let stop_flag = Arc::clone(&self.stop_flag);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                let changed = registry.sweep();
                if !changed.is_empty() {
                    debug!(count = changed.len(), "sweep reopened providers");
                }
            }
        });

        *self.task_handle.lock().await = Some(handle);
    }

    /// Stops the background task and waits for it to finish.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);

        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            // The task may be parked in a long sleep.
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Returns true if the background task is running.
    pub async fn is_running(&self) -> bool {
        self.task_handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HealthSweeper {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::{classify, ProviderFailure};
    use crate::health::{CircuitBreakerConfig, CircuitState};
    use crate::provider::Provider;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_half_opens_expired_circuit() {
        let clock = MockClock::default();
        let registry = Arc::new(HealthRegistry::with_clock(
            CircuitBreakerConfig::default(),
            Arc::new(clock.clone()),
        ));
        let err = classify(&ProviderFailure::new("502 bad gateway"), Provider::Gemini);
        for _ in 0..3 {
            registry.record_failure(Provider::Gemini, &err);
        }

        let sweeper = HealthSweeper::new(Arc::clone(&registry));
        sweeper.start().await;
        assert!(sweeper.is_running().await);

        clock.advance(chrono::Duration::seconds(61));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(registry.circuit_state(Provider::Gemini), CircuitState::HalfOpen);

        sweeper.stop().await;
        assert!(!sweeper.is_running().await);
    }
}
