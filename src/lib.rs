//! provider-failover - resilience layer for a pool of analysis providers.
//!
//! Classifies provider failures, tracks provider health behind a circuit
//! breaker, follows connectivity, picks the best provider for each call and
//! runs bulk jobs that switch providers when one keeps failing.

pub mod analyzer;
pub mod bulk;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod logging;
pub mod network;
pub mod notification;
pub mod provider;
pub mod selector;

pub use analyzer::{Analysis, Analyze, FnAnalyzer, WorkItem};
pub use bulk::{BulkError, BulkOptions, BulkOrchestrator, BulkOutcome, BulkProgress, BulkStats};
pub use crate::config::FailoverConfig;
pub use dispatch::{DispatchError, FailoverDispatcher};
pub use error::{classify, ClassifiedError, ErrorKind, ProviderFailure, RecoveryStrategy};
pub use health::{CircuitBreakerConfig, HealthRegistry, ProviderHealth};
pub use network::NetworkMonitor;
pub use provider::Provider;
pub use selector::ProviderSelector;
