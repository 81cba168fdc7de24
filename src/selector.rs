//! Provider selection on top of the health registry.

use std::sync::Arc;
use tracing::debug;

use crate::error::ClassifiedError;
use crate::health::HealthRegistry;
use crate::provider::Provider;

/// How many of the most recent errors [`ProviderSelector::should_switch`]
/// looks at.
pub const RECENT_ERROR_WINDOW: usize = 5;

/// Default number of recent errors that triggers a switch.
pub const DEFAULT_SWITCH_THRESHOLD: usize = 3;

/// Picks providers for new work.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    registry: Arc<HealthRegistry>,
}

impl ProviderSelector {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Picks the best enabled provider.
    ///
    /// Falls back to the first offline-capable provider in `enabled` when
    /// none is healthy; `None` only if there is no such provider either.
    pub fn select(&self, enabled: &[Provider]) -> Option<Provider> {
        if let Some(best) = self.registry.best_provider(enabled) {
            return Some(best);
        }

        let fallback = enabled.iter().copied().find(|p| p.is_offline_capable());
        if let Some(provider) = fallback {
            debug!(provider = %provider, "no healthy provider, falling back to offline-capable");
        }
        fallback
    }

    /// Like [`select`](Self::select) but never returns `current`.
    pub fn select_excluding(&self, enabled: &[Provider], current: Provider) -> Option<Provider> {
        let remaining: Vec<Provider> = enabled.iter().copied().filter(|p| *p != current).collect();
        self.select(&remaining)
    }

    /// Returns true if `current` accounts for more than `threshold` of the
    /// last [`RECENT_ERROR_WINDOW`] errors.
    pub fn should_switch(current: Provider, recent_errors: &[ClassifiedError], threshold: usize) -> bool {
        let start = recent_errors.len().saturating_sub(RECENT_ERROR_WINDOW);
        let attributed = recent_errors[start..]
            .iter()
            .filter(|e| e.provider == current)
            .count();
        attributed > threshold
    }
}
