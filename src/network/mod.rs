//! Connectivity tracking
//!
//! [`NetworkMonitor`] owns the process-wide [`NetworkState`]. States are
//! pushed in with [`NetworkMonitor::apply`] (or the `set_online` /
//! `update_quality` helpers) or produced by a [`ConnectivityProbe`] running on
//! a background task. Every change is broadcast to subscribers, and an
//! offline-to-online transition resets the circuit breakers of
//! network-dependent providers.

mod probe;

pub use probe::{ConnectivityProbe, TcpProbe};

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::HealthRegistry;

const EVENT_CAPACITY: usize = 32;

/// Snapshot of connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub online: bool,
    pub connection_type: String,
    pub effective_type: String,
    pub downlink_mbps: Option<f64>,
    pub round_trip_ms: Option<f64>,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::online()
    }
}

impl NetworkState {
    /// An online state with unknown connection quality.
    pub fn online() -> Self {
        Self {
            online: true,
            connection_type: "unknown".to_string(),
            effective_type: "unknown".to_string(),
            downlink_mbps: None,
            round_trip_ms: None,
        }
    }

    /// An offline state.
    pub fn offline() -> Self {
        Self {
            online: false,
            ..Self::online()
        }
    }
}

/// Tracks connectivity and fans out changes.
#[derive(Debug)]
pub struct NetworkMonitor {
    state: RwLock<NetworkState>,
    registry: Arc<HealthRegistry>,
    events: broadcast::Sender<NetworkState>,
}

impl NetworkMonitor {
    /// Creates a monitor that starts in the registry's connectivity state.
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        let state = if registry.is_online() {
            NetworkState::online()
        } else {
            NetworkState::offline()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(state),
            registry,
            events,
        }
    }

    /// Returns a copy of the current state.
    pub fn current_state(&self) -> NetworkState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns true if the last known state is online.
    pub fn is_online(&self) -> bool {
        self.current_state().online
    }

    /// Subscribes to state changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkState> {
        self.events.subscribe()
    }

    /// Replaces the current state.
    ///
    /// The registry flag, recovery and broadcast are updated under the state
    /// lock; the registry always agrees with the monitor about connectivity.
    ///
    /// Returns true if anything changed.
    pub fn apply(&self, next: NetworkState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *state, next.clone());

        self.registry.set_online(next.online);

        if !previous.online && next.online {
            info!("network connectivity restored");
            self.registry.recover_network_providers();
        } else if previous.online && !next.online {
            warn!("network connectivity lost");
        }

        if previous == next {
            return false;
        }

        debug!(
            online = next.online,
            effective_type = %next.effective_type,
            rtt_ms = ?next.round_trip_ms,
            "network state changed"
        );
        let _ = self.events.send(next);
        true
    }

    /// Flips the online flag, keeping the quality fields.
    pub fn set_online(&self, online: bool) -> bool {
        let mut next = self.current_state();
        next.online = online;
        self.apply(next)
    }

    /// Updates connection quality, keeping the online flag.
    pub fn update_quality(
        &self,
        connection_type: impl Into<String>,
        effective_type: impl Into<String>,
        downlink_mbps: Option<f64>,
        round_trip_ms: Option<f64>,
    ) -> bool {
        let next = NetworkState {
            connection_type: connection_type.into(),
            effective_type: effective_type.into(),
            downlink_mbps,
            round_trip_ms,
            ..self.current_state()
        };
        self.apply(next)
    }

    /// Feeds `probe` results into [`apply`](Self::apply) every `interval`.
    ///
    /// The task runs until the returned handle is aborted.
    pub fn spawn_probe<P>(self: &Arc<Self>, probe: P, interval: Duration) -> JoinHandle<()>
    where
        P: ConnectivityProbe + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let state = probe.probe().await;
                monitor.apply(state);
                tokio::time::sleep(interval).await;
            }
        })
    }
}
