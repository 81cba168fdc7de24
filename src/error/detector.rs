//! Pattern-based failure classifier
//!
//! Failure messages are matched against an ordered list of regex patterns;
//! the first match decides the [`ErrorKind`]. Cancellation and timeout
//! signals carried by the failure itself take precedence over any pattern.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{debug, trace};

use super::{ClassifiedError, ErrorKind, FailureSignal, ProviderFailure};
use crate::provider::Provider;

/// A regex pattern mapped to an error kind.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    regex: Regex,
    kind: ErrorKind,
    description: String,
}

impl ErrorPattern {
    /// Creates a new pattern.
    ///
    /// # Panics
    /// Panics if the regex pattern is invalid.
    pub fn new(pattern: &str, kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            regex: Regex::new(pattern).expect("Invalid regex pattern"),
            kind,
            description: description.into(),
        }
    }

    /// Returns the kind assigned on match.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Checks if this pattern matches the given text.
    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Classifies provider failures into the error taxonomy.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    /// Patterns in priority order.
    patterns: Vec<ErrorPattern>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Creates a classifier with the built-in patterns.
    pub fn new() -> Self {
        Self {
            patterns: Self::default_patterns(),
        }
    }

    /// Creates a classifier with custom patterns.
    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        Self { patterns }
    }

    /// Appends a pattern at the lowest priority.
    pub fn add_pattern(&mut self, pattern: ErrorPattern) {
        self.patterns.push(pattern);
    }

    /// Returns the patterns in priority order.
    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }

    fn default_patterns() -> Vec<ErrorPattern> {
        vec![
            ErrorPattern::new(r"(?i)aborted", ErrorKind::Timeout, "Request aborted"),
            // Authentication
            ErrorPattern::new(
                r"(?i)unauthori[sz]ed|authentication|api.?key|invalid.?key|forbidden|\b40[13]\b",
                ErrorKind::Authentication,
                "Credentials rejected",
            ),
            // Rate limiting
            ErrorPattern::new(
                r"(?i)rate.?limit|too.?many.?requests|quota|\b429\b|throttl",
                ErrorKind::RateLimit,
                "Provider throttling",
            ),
            // Server side
            ErrorPattern::new(
                r"(?i)\b50[0234]\b|internal.?server|bad.?gateway|service.?unavailable|gateway.?time.?out",
                ErrorKind::ServerError,
                "Provider server error",
            ),
            // Connectivity
            ErrorPattern::new(
                r"(?i)network|fetch|connection|timeout|timed out|offline|\bdns\b|unreachable",
                ErrorKind::Network,
                "Connectivity failure",
            ),
            ErrorPattern::new(
                r"(?i)json|parse|invalid response",
                ErrorKind::InvalidResponse,
                "Malformed provider response",
            ),
            ErrorPattern::new(
                r"(?i)not configured|missing|invalid config",
                ErrorKind::Configuration,
                "Provider not set up",
            ),
        ]
    }

    /// Determines the error kind for a failure without building the full
    /// classification.
    pub fn detect_kind(&self, failure: &ProviderFailure) -> ErrorKind {
        if matches!(
            failure.signal,
            Some(FailureSignal::Aborted) | Some(FailureSignal::TimedOut)
        ) {
            return ErrorKind::Timeout;
        }

        match self.patterns.iter().find(|p| p.matches(&failure.message)) {
            Some(pattern) => {
                trace!(pattern = pattern.description(), "failure matched pattern");
                pattern.kind()
            }
            None => ErrorKind::Unknown,
        }
    }

    /// Classifies a failure reported by `provider`.
    ///
    /// Total and deterministic: every input maps to exactly one
    /// classification, `ErrorKind::Unknown` when nothing matches.
    pub fn classify(&self, failure: &ProviderFailure, provider: Provider) -> ClassifiedError {
        let kind = self.detect_kind(failure);
        let recovery_strategy = kind.recovery_strategy(provider);

        debug!(
            provider = %provider,
            kind = %kind,
            strategy = ?recovery_strategy,
            "classified provider failure"
        );

        ClassifiedError {
            kind,
            provider,
            retryable: kind.is_retryable(),
            recovery_strategy,
            user_message: user_message(kind, provider),
            technical_message: failure.message.clone(),
            suggested_actions: suggested_actions(kind, provider),
            retry_delay_ms: kind
                .retry_delay(failure.retry_after)
                .map(|d| d.as_millis() as u64),
        }
    }
}

fn default_classifier() -> &'static ErrorClassifier {
    static CLASSIFIER: OnceLock<ErrorClassifier> = OnceLock::new();
    CLASSIFIER.get_or_init(ErrorClassifier::new)
}

/// Classifies a failure with the built-in patterns.
pub fn classify(failure: &ProviderFailure, provider: Provider) -> ClassifiedError {
    default_classifier().classify(failure, provider)
}

/// Summarizes a set of classified errors into one user-facing line.
pub fn create_error_summary(errors: &[ClassifiedError]) -> String {
    match errors {
        [] => "No errors to report".to_string(),
        [single] => single.user_message.clone(),
        _ => {
            if errors.iter().any(|e| e.kind == ErrorKind::Network) {
                return "Network connectivity issues detected. Switching to offline-capable providers..."
                    .to_string();
            }
            if errors.iter().any(|e| e.kind == ErrorKind::Authentication) {
                let providers: BTreeSet<Provider> = errors.iter().map(|e| e.provider).collect();
                return format!(
                    "Authentication issues with {} provider(s). Please check your API keys.",
                    providers.len()
                );
            }
            "Multiple providers encountered issues. Attempting automatic recovery...".to_string()
        }
    }
}

fn user_message(kind: ErrorKind, provider: Provider) -> String {
    let name = provider.display_name();
    match kind {
        ErrorKind::Network => {
            format!("Unable to connect to {name}. Checking for alternative providers...")
        }
        ErrorKind::Timeout => {
            format!("{name} is taking too long to respond. Trying alternative providers...")
        }
        ErrorKind::Authentication => {
            format!("{name} authentication failed. Please check your API key.")
        }
        ErrorKind::RateLimit => {
            format!("{name} rate limit reached. Waiting before retry or switching providers...")
        }
        ErrorKind::ServerError => {
            format!("{name} is experiencing issues. Switching to alternative provider...")
        }
        ErrorKind::InvalidResponse => {
            format!("{name} returned an unexpected response. Retrying...")
        }
        ErrorKind::Configuration => {
            format!("{name} is not properly configured. Please check the provider settings.")
        }
        ErrorKind::Unknown => {
            format!("{name} encountered an error. Trying alternative providers...")
        }
    }
}

fn suggested_actions(kind: ErrorKind, provider: Provider) -> Vec<String> {
    let name = provider.display_name();
    let mut actions: Vec<String> = match kind {
        ErrorKind::Network => vec![
            "Check your internet connection".into(),
            "Use a local model (Ollama) for offline analysis".into(),
        ],
        ErrorKind::Authentication => vec![
            format!("Verify your {name} API key"),
            "Ensure the API key has the correct permissions".into(),
            "Try regenerating your API key".into(),
        ],
        ErrorKind::RateLimit => vec![
            "Wait a few minutes before trying again".into(),
            "Consider upgrading your API plan".into(),
            "Enable multiple providers for automatic fallback".into(),
        ],
        ErrorKind::ServerError => vec![
            format!("Check {name} service status"),
            "Try again in a few minutes".into(),
            "Enable backup providers".into(),
        ],
        ErrorKind::Timeout => vec![
            "Increase the provider timeout".into(),
            "Check your internet connection speed".into(),
            "Try a different provider".into(),
        ],
        ErrorKind::Configuration => vec![
            format!("Complete {name} setup"),
            "Verify all required configuration fields".into(),
            "Test the connection after configuration".into(),
        ],
        ErrorKind::InvalidResponse | ErrorKind::Unknown => vec![
            "Retry the request".into(),
            "Check the provider configuration".into(),
            "Contact support if the issue persists".into(),
        ],
    };

    if kind == ErrorKind::Network && provider.is_network_dependent() {
        actions.push("Switch to offline mode".into());
    }

    actions
}
