//! Connectivity probes.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::trace;

use super::NetworkState;

/// Produces a fresh [`NetworkState`] on demand.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + fmt::Debug {
    async fn probe(&self) -> NetworkState;
}

/// Probes connectivity by opening a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Creates a probe for `address` (`host:port`) with a 3 second timeout.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(3),
        }
    }

    /// Sets the connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the probed address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> NetworkState {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_stream)) => {
                let rtt = started.elapsed().as_secs_f64() * 1000.0;
                trace!(address = %self.address, rtt_ms = rtt, "probe connected");
                NetworkState {
                    online: true,
                    connection_type: "tcp".to_string(),
                    effective_type: effective_type(rtt).to_string(),
                    downlink_mbps: None,
                    round_trip_ms: Some(rtt),
                }
            }
            Ok(Err(err)) => {
                trace!(address = %self.address, error = %err, "probe failed");
                NetworkState::offline()
            }
            Err(_) => {
                trace!(address = %self.address, "probe timed out");
                NetworkState::offline()
            }
        }
    }
}

/// Buckets a round-trip time the way browsers report `effectiveType`.
fn effective_type(rtt_ms: f64) -> &'static str {
    if rtt_ms < 100.0 {
        "4g"
    } else if rtt_ms < 300.0 {
        "3g"
    } else if rtt_ms < 1400.0 {
        "2g"
    } else {
        "slow-2g"
    }
}
