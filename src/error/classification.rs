//! Error taxonomy for provider failures.
//!
//! A raw [`ProviderFailure`] returned by a backend is normalized into a
//! [`ClassifiedError`]: one [`ErrorKind`] out of a closed set, the
//! [`RecoveryStrategy`] callers should follow, and ready-to-display text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::provider::Provider;

/// Default wait before retrying a rate-limited provider.
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// Wait before retrying a provider that returned a server error.
pub const SERVER_ERROR_DELAY: Duration = Duration::from_secs(30);

/// Wait before retrying after a connectivity failure or timeout.
pub const NETWORK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The closed taxonomy of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity problem between us and the provider.
    Network,
    /// Credentials rejected or missing permissions.
    Authentication,
    /// Provider throttled the request.
    RateLimit,
    /// Provider-side 5xx or unavailability.
    ServerError,
    /// Request cancelled or timed out.
    Timeout,
    /// Provider answered with a payload we could not use.
    InvalidResponse,
    /// Provider is not set up.
    Configuration,
    /// Nothing more specific matched.
    Unknown,
}

impl ErrorKind {
    /// Every kind, in taxonomy order.
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Network,
        ErrorKind::Authentication,
        ErrorKind::RateLimit,
        ErrorKind::ServerError,
        ErrorKind::Timeout,
        ErrorKind::InvalidResponse,
        ErrorKind::Configuration,
        ErrorKind::Unknown,
    ];

    /// Snake-case identifier, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Only authentication and configuration failures need a human first.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Authentication | ErrorKind::Configuration)
    }

    /// Maps a kind to the recovery strategy for the failing provider.
    pub fn recovery_strategy(self, provider: Provider) -> RecoveryStrategy {
        match self {
            ErrorKind::Network | ErrorKind::Timeout => {
                if provider.is_network_dependent() {
                    RecoveryStrategy::FallbackLocal
                } else {
                    RecoveryStrategy::RetrySameProvider
                }
            }
            ErrorKind::Authentication | ErrorKind::Configuration => {
                RecoveryStrategy::UserActionRequired
            }
            ErrorKind::RateLimit => RecoveryStrategy::WaitAndRetry,
            ErrorKind::ServerError | ErrorKind::Unknown => RecoveryStrategy::SwitchProvider,
            ErrorKind::InvalidResponse => RecoveryStrategy::RetrySameProvider,
        }
    }

    /// Suggested wait before the next attempt, if the kind has one.
    ///
    /// `provider_hint` is the delay the provider asked for (e.g. a
    /// `Retry-After` header); it only applies to rate limits.
    pub fn retry_delay(self, provider_hint: Option<Duration>) -> Option<Duration> {
        match self {
            ErrorKind::RateLimit => Some(provider_hint.unwrap_or(DEFAULT_RATE_LIMIT_DELAY)),
            ErrorKind::ServerError => Some(SERVER_ERROR_DELAY),
            ErrorKind::Network | ErrorKind::Timeout => Some(NETWORK_RETRY_DELAY),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Try the same provider again.
    RetrySameProvider,
    /// Move to another provider.
    SwitchProvider,
    /// Move to a provider that works without network access.
    FallbackLocal,
    /// Stop; a person has to fix credentials or setup.
    UserActionRequired,
    /// Wait for the suggested delay, then retry.
    WaitAndRetry,
}

impl RecoveryStrategy {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::RetrySameProvider => "retry_same_provider",
            RecoveryStrategy::SwitchProvider => "switch_provider",
            RecoveryStrategy::FallbackLocal => "fallback_local",
            RecoveryStrategy::UserActionRequired => "user_action_required",
            RecoveryStrategy::WaitAndRetry => "wait_and_retry",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band signal attached to a failure by the code that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignal {
    /// The call was cancelled before it completed.
    Aborted,
    /// The call exceeded its deadline.
    TimedOut,
}

/// Raw failure returned by a provider's analyze operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderFailure {
    /// Message as reported by the provider or transport.
    pub message: String,
    /// Cancellation or deadline signal, when the failure carries one.
    pub signal: Option<FailureSignal>,
    /// Delay the provider asked for before the next request.
    pub retry_after: Option<Duration>,
}

impl ProviderFailure {
    /// Creates a failure from a message alone.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            signal: None,
            retry_after: None,
        }
    }

    /// Creates a failure for a cancelled call.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            signal: Some(FailureSignal::Aborted),
            ..Self::new(message)
        }
    }

    /// Creates a failure for a call that hit its deadline.
    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            signal: Some(FailureSignal::TimedOut),
            ..Self::new(message)
        }
    }

    /// Attaches a provider-supplied retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl From<String> for ProviderFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<tokio::time::error::Elapsed> for ProviderFailure {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::timed_out(format!("request {}", err))
    }
}

/// A failure normalized into the taxonomy, ready to display and act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Taxonomy bucket.
    pub kind: ErrorKind,
    /// Provider the failure is attributed to.
    pub provider: Provider,
    /// Whether retrying can possibly help.
    pub retryable: bool,
    /// Recommended next step.
    pub recovery_strategy: RecoveryStrategy,
    /// Message safe to show to end users.
    pub user_message: String,
    /// Original failure text.
    pub technical_message: String,
    /// Concrete things the user can try.
    pub suggested_actions: Vec<String>,
    /// Suggested wait before retrying, in milliseconds.
    pub retry_delay_ms: Option<u64>,
}

impl ClassifiedError {
    /// Suggested wait before retrying.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }

    /// Returns true if the caller should move to a different provider.
    pub fn should_switch_provider(&self) -> bool {
        matches!(
            self.recovery_strategy,
            RecoveryStrategy::SwitchProvider | RecoveryStrategy::FallbackLocal
        )
    }

    /// Returns true if nothing automatic will fix this failure.
    pub fn requires_user_action(&self) -> bool {
        self.recovery_strategy == RecoveryStrategy::UserActionRequired
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let not_retryable: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|k| !k.is_retryable())
            .collect();
        assert_eq!(
            not_retryable,
            vec![ErrorKind::Authentication, ErrorKind::Configuration]
        );
    }

    #[test]
    fn test_network_strategy_depends_on_provider() {
        assert_eq!(
            ErrorKind::Network.recovery_strategy(Provider::Gemini),
            RecoveryStrategy::FallbackLocal
        );
        assert_eq!(
            ErrorKind::Timeout.recovery_strategy(Provider::SentimentApi),
            RecoveryStrategy::FallbackLocal
        );
        assert_eq!(
            ErrorKind::Network.recovery_strategy(Provider::Ollama),
            RecoveryStrategy::RetrySameProvider
        );
        assert_eq!(
            ErrorKind::Timeout.recovery_strategy(Provider::HuggingFace),
            RecoveryStrategy::RetrySameProvider
        );
    }

    #[test]
    fn test_fixed_strategies() {
        for provider in Provider::ALL {
            assert_eq!(
                ErrorKind::Authentication.recovery_strategy(provider),
                RecoveryStrategy::UserActionRequired
            );
            assert_eq!(
                ErrorKind::Configuration.recovery_strategy(provider),
                RecoveryStrategy::UserActionRequired
            );
            assert_eq!(
                ErrorKind::RateLimit.recovery_strategy(provider),
                RecoveryStrategy::WaitAndRetry
            );
            assert_eq!(
                ErrorKind::ServerError.recovery_strategy(provider),
                RecoveryStrategy::SwitchProvider
            );
            assert_eq!(
                ErrorKind::InvalidResponse.recovery_strategy(provider),
                RecoveryStrategy::RetrySameProvider
            );
            assert_eq!(
                ErrorKind::Unknown.recovery_strategy(provider),
                RecoveryStrategy::SwitchProvider
            );
        }
    }

    #[test]
    fn test_switch_and_user_action_helpers() {
        let network = crate::error::classify(&ProviderFailure::new("fetch failed"), Provider::Gemini);
        assert!(network.should_switch_provider());
        assert!(!network.requires_user_action());

        let auth = crate::error::classify(&ProviderFailure::new("Invalid API key"), Provider::Gemini);
        assert!(auth.requires_user_action());
        assert!(!auth.should_switch_provider());

        let throttled = crate::error::classify(&ProviderFailure::new("429"), Provider::Gemini);
        assert!(!throttled.should_switch_provider());
        assert!(!throttled.requires_user_action());
    }

    #[test]
    fn test_retry_delays() {
        assert_eq!(
            ErrorKind::RateLimit.retry_delay(None),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            ErrorKind::RateLimit.retry_delay(Some(Duration::from_secs(7))),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            ErrorKind::ServerError.retry_delay(Some(Duration::from_secs(7))),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            ErrorKind::Network.retry_delay(None),
            Some(Duration::from_secs(5))
        );
        assert_eq!(ErrorKind::Authentication.retry_delay(None), None);
        assert_eq!(ErrorKind::Unknown.retry_delay(None), None);
    }

    #[test]
    fn test_provider_failure_builders() {
        let failure = ProviderFailure::new("429").with_retry_after(Duration::from_secs(3));
        assert_eq!(failure.signal, None);
        assert_eq!(failure.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(failure.to_string(), "429");

        assert_eq!(
            ProviderFailure::aborted("stop").signal,
            Some(FailureSignal::Aborted)
        );
        assert_eq!(
            ProviderFailure::timed_out("slow").signal,
            Some(FailureSignal::TimedOut)
        );
    }

    #[tokio::test]
    async fn test_elapsed_converts_to_timed_out() {
        let elapsed = tokio::time::timeout(
            Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        let failure = ProviderFailure::from(elapsed);
        assert_eq!(failure.signal, Some(FailureSignal::TimedOut));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::ServerError).unwrap(),
            "\"server_error\""
        );
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(
            serde_json::to_string(&RecoveryStrategy::FallbackLocal).unwrap(),
            format!("\"{}\"", RecoveryStrategy::FallbackLocal)
        );
    }
}
