//! Provider identities and static metadata.
//!
//! The set of backends is closed: every map keyed by provider is built from
//! [`Provider::ALL`], so adding a backend is a compile-time change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One of the known analysis backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Local transformer model, runs without network access.
    #[serde(rename = "huggingface")]
    HuggingFace,
    /// Local model daemon.
    Ollama,
    /// Remote LLM.
    Gemini,
    /// Generic remote REST API.
    SentimentApi,
}

impl Provider {
    /// Every provider, in default priority order.
    pub const ALL: [Provider; 4] = [
        Provider::HuggingFace,
        Provider::Ollama,
        Provider::Gemini,
        Provider::SentimentApi,
    ];

    /// Stable identifier used in configuration and on the command line.
    pub fn id(self) -> &'static str {
        match self {
            Provider::HuggingFace => "huggingface",
            Provider::Ollama => "ollama",
            Provider::Gemini => "gemini",
            Provider::SentimentApi => "sentiment-api",
        }
    }

    /// Returns true if the provider needs outbound connectivity.
    pub fn is_network_dependent(self) -> bool {
        matches!(self, Provider::Gemini | Provider::SentimentApi)
    }

    /// Returns true if the provider keeps working while offline.
    pub fn is_offline_capable(self) -> bool {
        !self.is_network_dependent()
    }

    /// Human-readable name for messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::HuggingFace => "HuggingFace",
            Provider::Ollama => "Ollama",
            Provider::Gemini => "Google Gemini",
            Provider::SentimentApi => "Sentiment API",
        }
    }

    /// One-line description of where the provider runs.
    pub fn description(self) -> &'static str {
        match self {
            Provider::HuggingFace => "Runs locally, no API key needed",
            Provider::Ollama => "Local AI models, complete privacy",
            Provider::Gemini => "Google's hosted language model",
            Provider::SentimentApi => "Cloud-based sentiment analysis",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Error returned when parsing an unknown provider identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider '{0}' (expected one of: huggingface, ollama, gemini, sentiment-api)")]
pub struct ProviderParseError(pub String);

impl FromStr for Provider {
    type Err = ProviderParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.id() == normalized)
            .ok_or_else(|| ProviderParseError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_dependence() {
        assert!(Provider::Gemini.is_network_dependent());
        assert!(Provider::SentimentApi.is_network_dependent());
        assert!(Provider::HuggingFace.is_offline_capable());
        assert!(Provider::Ollama.is_offline_capable());
    }

    #[test]
    fn test_parse_round_trips_ids() {
        for provider in Provider::ALL {
            assert_eq!(provider.id().parse::<Provider>(), Ok(provider));
        }
        assert_eq!(" Gemini ".parse::<Provider>(), Ok(Provider::Gemini));
    }

    #[test]
    fn test_parse_unknown() {
        let err = "openai".parse::<Provider>().unwrap_err();
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn test_serde_uses_ids() {
        let json = serde_json::to_string(&Provider::SentimentApi).unwrap();
        assert_eq!(json, "\"sentiment-api\"");
        let parsed: Provider = serde_json::from_str("\"huggingface\"").unwrap();
        assert_eq!(parsed, Provider::HuggingFace);
    }
}
