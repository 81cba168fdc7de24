//! User-facing health and network notifications.
//!
//! [`NotificationTracker`] watches health and network events, compares them
//! with what it saw last, and turns meaningful transitions into
//! [`Notification`]s. Repeats are suppressed: a provider that keeps failing
//! produces one "failing" notice, not one per failure.

mod renderer;

pub use renderer::{NotificationRenderer, Theme};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::health::{HealthEvent, ProviderHealth};
use crate::network::NetworkState;
use crate::provider::Provider;

/// A notable change in connectivity or provider health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Connectivity came back.
    NetworkConnected,

    /// Connectivity was lost.
    NetworkDisconnected,

    /// A provider's circuit opened after repeated failures.
    CircuitOpened { provider: Provider, failures: u32 },

    /// A provider's circuit closed or moved to half-open.
    CircuitClosed { provider: Provider },

    /// A provider reached the failure count worth telling the user about.
    ProviderFailing { provider: Provider, failures: u32 },

    /// A provider that was failing is working normally again.
    ProviderRecovered {
        provider: Provider,
        average_response_ms: f64,
    },

    /// A provider's average response time crossed the slow threshold.
    SlowResponse {
        provider: Provider,
        average_response_ms: f64,
    },
}

impl Notification {
    /// Short headline.
    pub fn title(&self) -> &'static str {
        match self {
            Notification::NetworkConnected => "Network Connected",
            Notification::NetworkDisconnected => "Network Disconnected",
            Notification::CircuitOpened { .. } => "Circuit Breaker Opened",
            Notification::CircuitClosed { .. } => "Circuit Breaker Closed",
            Notification::ProviderFailing { .. } => "Provider Issues Detected",
            Notification::ProviderRecovered { .. } => "Provider Recovered",
            Notification::SlowResponse { .. } => "Slow Response Detected",
        }
    }

    /// One-sentence explanation.
    pub fn description(&self) -> String {
        match self {
            Notification::NetworkConnected => {
                "Connection restored. Network-dependent providers are available again.".to_string()
            }
            Notification::NetworkDisconnected => {
                "Connection lost. Switching to offline-capable providers (HuggingFace, Ollama)."
                    .to_string()
            }
            Notification::CircuitOpened { provider, failures } => format!(
                "{} disabled after {} consecutive failures. Will retry automatically.",
                provider.display_name(),
                failures
            ),
            Notification::CircuitClosed { provider } => format!(
                "{} is available again and ready for requests.",
                provider.display_name()
            ),
            Notification::ProviderFailing { provider, failures } => format!(
                "{} has failed {} times in a row. Automatic fallback is active.",
                provider.display_name(),
                failures
            ),
            Notification::ProviderRecovered {
                provider,
                average_response_ms,
            } => format!(
                "{} is working normally. Response time: {}ms",
                provider.display_name(),
                average_response_ms.round()
            ),
            Notification::SlowResponse {
                provider,
                average_response_ms,
            } => format!(
                "{} is responding slowly ({}ms). Consider switching providers.",
                provider.display_name(),
                average_response_ms.round()
            ),
        }
    }

    /// Returns true for notices about something going wrong.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Notification::NetworkDisconnected
                | Notification::CircuitOpened { .. }
                | Notification::ProviderFailing { .. }
                | Notification::SlowResponse { .. }
        )
    }

    /// Returns true for notices about something getting better.
    pub fn is_recovery(&self) -> bool {
        matches!(
            self,
            Notification::NetworkConnected
                | Notification::CircuitClosed { .. }
                | Notification::ProviderRecovered { .. }
        )
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.description())
    }
}

/// Which notifications to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub show_network_changes: bool,
    pub show_provider_failures: bool,
    pub show_provider_recovery: bool,
    pub show_circuit_breaker_events: bool,
    /// Off by default; slow providers are common and the notice is noisy.
    pub show_performance_alerts: bool,
    pub minimum_failures_for_notification: u32,
    pub slow_response_threshold_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            show_network_changes: true,
            show_provider_failures: true,
            show_provider_recovery: true,
            show_circuit_breaker_events: true,
            show_performance_alerts: false,
            minimum_failures_for_notification: 2,
            slow_response_threshold_ms: 5000,
        }
    }
}

/// Turns event streams into deduplicated notifications.
#[derive(Debug, Clone)]
pub struct NotificationTracker {
    settings: NotificationSettings,
    online: Option<bool>,
    previous: HashMap<Provider, ProviderHealth>,
}

impl NotificationTracker {
    pub fn new(settings: NotificationSettings) -> Self {
        Self {
            settings,
            online: None,
            previous: HashMap::new(),
        }
    }

    /// Seeds the last known connectivity so the first change is reported.
    pub fn with_online(mut self, online: bool) -> Self {
        self.online = Some(online);
        self
    }

    pub fn settings(&self) -> &NotificationSettings {
        &self.settings
    }

    /// Observes a network state. The very first observation only seeds the
    /// tracker unless [`with_online`](Self::with_online) was used.
    pub fn observe_network(&mut self, state: &NetworkState) -> Option<Notification> {
        let previous = self.online.replace(state.online);
        if !self.settings.show_network_changes {
            return None;
        }
        match previous {
            Some(was) if was != state.online => Some(if state.online {
                Notification::NetworkConnected
            } else {
                Notification::NetworkDisconnected
            }),
            _ => None,
        }
    }

    /// Observes a health event.
    pub fn observe_health(&mut self, event: &HealthEvent) -> Vec<Notification> {
        let provider = event.provider;
        let health = &event.health;
        let previous = self
            .previous
            .insert(provider, health.clone())
            .unwrap_or_default();
        let settings = &self.settings;
        let mut out = Vec::new();

        if settings.show_circuit_breaker_events {
            if !previous.circuit_open && health.circuit_open {
                out.push(Notification::CircuitOpened {
                    provider,
                    failures: health.consecutive_failures,
                });
            } else if previous.circuit_open && !health.circuit_open {
                out.push(Notification::CircuitClosed { provider });
            }
        }

        let minimum = settings.minimum_failures_for_notification;
        if settings.show_provider_failures
            && !health.circuit_open
            && health.consecutive_failures == minimum
            && health.consecutive_failures > previous.consecutive_failures
        {
            out.push(Notification::ProviderFailing {
                provider,
                failures: health.consecutive_failures,
            });
        }

        if settings.show_provider_recovery {
            let was_unhealthy = !previous.healthy || previous.consecutive_failures > 0;
            let now_healthy = health.healthy && health.consecutive_failures == 0;
            if was_unhealthy && now_healthy {
                out.push(Notification::ProviderRecovered {
                    provider,
                    average_response_ms: health.average_response_time_ms,
                });
            }
        }

        let threshold = settings.slow_response_threshold_ms as f64;
        if settings.show_performance_alerts
            && previous.average_response_time_ms <= threshold
            && health.average_response_time_ms > threshold
        {
            out.push(Notification::SlowResponse {
                provider,
                average_response_ms: health.average_response_time_ms,
            });
        }

        out
    }
}

impl Default for NotificationTracker {
    fn default() -> Self {
        Self::new(NotificationSettings::default())
    }
}
