//! Generative provider contract and prompt profile selection
//!
//! The generative transform itself is an external collaborator. The core
//! selects a prompt profile and a model route, bounds the call with a
//! timeout, and maps provider failures onto the retry taxonomy; it never
//! re-derives the provider's internal retry or fallback behavior.

use crate::config::{ModelRoute, ProviderConfig};
use crate::error::PipelineError;
use crate::models::{Category, RenderMode};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Category/style-selected prompt bundle handed to the provider
#[derive(Debug, Clone)]
pub struct PromptProfile {
    pub category: Category,
    pub style: String,
    pub prompt: String,
    pub negative_prompt: String,
}

impl PromptProfile {
    /// Select the profile for a category/style pair
    pub fn select(category: Category, style: &str) -> Self {
        let (prompt, negative_prompt) = match category {
            Category::Clothing => (
                format!("product photo of the garment, {} styling, studio lighting", style),
                "wrinkles, mannequin, busy background".to_string(),
            ),
            Category::Portrait => (
                format!("professional portrait, {} look, soft key light", style),
                "distorted features, extra fingers".to_string(),
            ),
            Category::Product => (
                format!("catalog shot, {} backdrop, crisp shadows", style),
                "clutter, reflections".to_string(),
            ),
            Category::Pet => (
                format!("pet portrait, {} scene, shallow depth of field", style),
                "motion blur, cropped ears".to_string(),
            ),
        };

        Self {
            category,
            style: style.to_string(),
            prompt,
            negative_prompt,
        }
    }
}

/// Failure kinds a provider can signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Timeout,
    ServerError,
    ContentPolicy,
    InvalidInput,
}

/// Error returned by a generative provider call
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider failure ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Content-policy and input-validation rejections must not be retried
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout | ProviderErrorKind::ServerError
        )
    }
}

impl From<ProviderError> for PipelineError {
    fn from(error: ProviderError) -> Self {
        match error.kind {
            ProviderErrorKind::ContentPolicy => PipelineError::ContentPolicyViolation {
                message: error.message,
            },
            ProviderErrorKind::InvalidInput => PipelineError::InvalidInput {
                message: error.message,
            },
            ProviderErrorKind::Timeout | ProviderErrorKind::ServerError => {
                PipelineError::ProviderTransient {
                    message: error.message,
                }
            }
        }
    }
}

/// Resolve the model route for a category, falling back to any configured
/// route when the category has none
pub fn route_for(config: &ProviderConfig, category: Category) -> Option<&ModelRoute> {
    config
        .routes
        .get(category.as_str())
        .or_else(|| config.routes.values().next())
}

/// Pick the model name for a route and render mode
pub fn model_for(route: &ModelRoute, mode: RenderMode) -> &str {
    match mode {
        RenderMode::Hd => route.hd.as_deref().unwrap_or(&route.primary),
        RenderMode::Standard => &route.primary,
    }
}

/// External generative transform service
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transform the cutout according to the prompt profile using the given
    /// model. The call must respect `timeout`; the pipeline also bounds it
    /// externally.
    async fn transform(
        &self,
        cutout_png: &[u8],
        profile: &PromptProfile,
        model: &str,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, ProviderError>;
}

/// Scriptable provider for tests and the CLI's offline mode.
///
/// Consumes a queue of scripted failures, then echoes the cutout back as the
/// "transformed" image.
#[derive(Debug, Default)]
pub struct MockProvider {
    scripted_failures: Mutex<VecDeque<ProviderError>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `failures.len()` calls with the given errors, in order
    pub fn with_failures(failures: Vec<ProviderError>) -> Self {
        Self {
            scripted_failures: Mutex::new(failures.into()),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of transform calls made so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn transform(
        &self,
        cutout_png: &[u8],
        profile: &PromptProfile,
        model: &str,
        _timeout: Duration,
    ) -> std::result::Result<Vec<u8>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.scripted_failures.lock().await.pop_front() {
            return Err(error);
        }

        tracing::debug!(
            model,
            category = profile.category.as_str(),
            style = %profile.style,
            "mock provider echoing cutout"
        );
        Ok(cutout_png.to_vec())
    }
}
