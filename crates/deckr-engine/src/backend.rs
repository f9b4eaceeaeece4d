//! External collaborator contracts
//!
//! The engine never talks to a model directly. Plan generation and every
//! generative call go through these traits. [`BoundedBackend`] wraps any
//! backend with the bounded-wait policy: a concurrency cap and a per-call
//! timeout.

use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::types::{ImageRef, NormalizedImage, SlideId, SlideSummary};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Candidates returned by edit and create calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    /// Candidate images
    pub images: Vec<ImageRef>,
    /// Prompt used per candidate, parallel to `images`
    pub prompts: Vec<String>,
}

impl Generation {
    /// Create from parallel lists
    #[inline]
    #[must_use]
    pub fn new(images: Vec<ImageRef>, prompts: Vec<String>) -> Self {
        Self { images, prompts }
    }

    /// Pair each image with its prompt, falling back to `default_prompt`
    /// when the backend returned fewer prompts than images
    #[must_use]
    pub fn paired(self, default_prompt: &str) -> Vec<(ImageRef, String)> {
        let mut prompts = self.prompts.into_iter();
        self.images
            .into_iter()
            .map(|image| {
                let prompt = prompts.next().unwrap_or_else(|| default_prompt.to_string());
                (image, prompt)
            })
            .collect()
    }
}

/// Extra inputs for slide creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationExtras {
    /// Name of the slide being created
    pub slide_name: String,
    /// Slide it will follow
    pub insert_after: SlideId,
}

/// Produces an execution plan from a natural-language request
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Generate an untyped plan; the engine validates it before use
    async fn generate_plan(
        &self,
        request: &str,
        slides: &[SlideSummary],
    ) -> Result<serde_json::Value, BackendError>;
}

/// Generative image backend
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GenerativeBackend: Send + Sync {
    /// Edit a rendering according to `prompt`
    async fn edit_slide(
        &self,
        base: &NormalizedImage,
        prompt: &str,
        deep_mode: bool,
    ) -> Result<Generation, BackendError>;

    /// Create a new slide using `reference` for style and content
    async fn create_slide(
        &self,
        reference: &NormalizedImage,
        prompt: &str,
        deep_mode: bool,
        extras: &CreationExtras,
    ) -> Result<Generation, BackendError>;

    /// Variations of `base` with a given model
    async fn generate_variations(
        &self,
        model: &str,
        prompt: &str,
        base: &NormalizedImage,
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError>;

    /// Remake `base` following reference images
    async fn remake_with_reference(
        &self,
        prompt: &str,
        base: &NormalizedImage,
        references: &[NormalizedImage],
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError>;
}

/// Backend decorator enforcing the bounded-wait policy
///
/// At most `max_concurrent_generations` calls run at once; each call is
/// abandoned with `BackendError::Timeout` after `generation_timeout`. The
/// wait for a permit counts against the timeout.
pub struct BoundedBackend<B: ?Sized> {
    inner: Arc<B>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl<B: ?Sized> std::fmt::Debug for BoundedBackend<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedBackend")
            .field("available_permits", &self.permits.available_permits())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<B: GenerativeBackend + ?Sized> BoundedBackend<B> {
    /// Wrap `inner` using limits from `config`
    #[must_use]
    pub fn new(inner: Arc<B>, config: &EngineConfig) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(config.max_concurrent_generations.max(1))),
            timeout: config.generation_timeout(),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>> + Send,
    {
        let guarded = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| BackendError::Unavailable("generation limiter closed".to_string()))?;
            call.await
        };

        match tokio::time::timeout(self.timeout, guarded).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                duration_secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl<B: GenerativeBackend + ?Sized> GenerativeBackend for BoundedBackend<B> {
    async fn edit_slide(
        &self,
        base: &NormalizedImage,
        prompt: &str,
        deep_mode: bool,
    ) -> Result<Generation, BackendError> {
        self.bounded(self.inner.edit_slide(base, prompt, deep_mode))
            .await
    }

    async fn create_slide(
        &self,
        reference: &NormalizedImage,
        prompt: &str,
        deep_mode: bool,
        extras: &CreationExtras,
    ) -> Result<Generation, BackendError> {
        self.bounded(self.inner.create_slide(reference, prompt, deep_mode, extras))
            .await
    }

    async fn generate_variations(
        &self,
        model: &str,
        prompt: &str,
        base: &NormalizedImage,
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError> {
        self.bounded(self.inner.generate_variations(model, prompt, base, deep_mode))
            .await
    }

    async fn remake_with_reference(
        &self,
        prompt: &str,
        base: &NormalizedImage,
        references: &[NormalizedImage],
        deep_mode: bool,
    ) -> Result<Vec<ImageRef>, BackendError> {
        self.bounded(
            self.inner
                .remake_with_reference(prompt, base, references, deep_mode),
        )
        .await
    }
}
