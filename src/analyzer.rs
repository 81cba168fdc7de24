//! The analysis port.
//!
//! Providers are opaque: whatever performs the actual analysis implements
//! [`Analyze`], and the failover layer only sees a result or a
//! [`ProviderFailure`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::ProviderFailure;
use crate::provider::Provider;

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl WorkItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            customer_id: None,
            channel: None,
        }
    }

    pub fn with_customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl From<&str> for WorkItem {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for WorkItem {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Result returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Category assigned by the provider.
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Analysis {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Performs the analysis of one item on one provider.
#[async_trait]
pub trait Analyze: Send + Sync {
    async fn analyze(&self, provider: Provider, item: &WorkItem) -> Result<Analysis, ProviderFailure>;
}

#[async_trait]
impl<T: Analyze + ?Sized> Analyze for Arc<T> {
    async fn analyze(&self, provider: Provider, item: &WorkItem) -> Result<Analysis, ProviderFailure> {
        (**self).analyze(provider, item).await
    }
}

/// Adapts an async closure to [`Analyze`].
///
/// ```ignore
/// let analyzer = FnAnalyzer::new(|provider, item: WorkItem| async move {
///     Ok(Analysis::new("neutral", 0.5))
/// });
/// ```
pub struct FnAnalyzer<F> {
    f: F,
}

impl<F> FnAnalyzer<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(Provider, WorkItem) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Analysis, ProviderFailure>> + Send,
    {
        Self { f }
    }
}

impl<F> fmt::Debug for FnAnalyzer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAnalyzer").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Analyze for FnAnalyzer<F>
where
    F: Fn(Provider, WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Analysis, ProviderFailure>> + Send,
{
    async fn analyze(&self, provider: Provider, item: &WorkItem) -> Result<Analysis, ProviderFailure> {
        (self.f)(provider, item.clone()).await
    }
}
