//! Edit propagation ("apply to all")
//!
//! Replays the intent of an accepted single-slide edit against other
//! slides. Unlike plan execution and single-slide edits, propagated results
//! skip review: the first candidate per slide is normalized and committed
//! straight to history.

use crate::backend::GenerativeBackend;
use crate::deck::DeckHandle;
use crate::error::{BackendError, EngineError, UnitFailure};
use crate::normalizer::ImageNormalizer;
use crate::types::{ImageRef, LastSuccessfulEditContext, Slide, SlideId};
use std::sync::Arc;

/// Outcome of a propagation pass
#[derive(Debug, Default)]
pub struct PropagationReport {
    /// Slides that received a new rendering
    pub committed: Vec<SlideId>,
    /// Slides left unchanged
    pub failures: Vec<UnitFailure>,
}

impl PropagationReport {
    /// Whether every target was committed
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Target ids of failed slides
    #[must_use]
    pub fn failed_targets(&self) -> Vec<&SlideId> {
        self.failures.iter().map(|f| &f.target).collect()
    }
}

/// Edit propagation engine
#[derive(Clone)]
pub struct EditPropagator {
    deck: DeckHandle,
    backend: Arc<dyn GenerativeBackend>,
    normalizer: ImageNormalizer,
}

impl std::fmt::Debug for EditPropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditPropagator").finish_non_exhaustive()
    }
}

impl EditPropagator {
    /// Create new propagator
    #[must_use]
    pub fn new(
        deck: DeckHandle,
        backend: Arc<dyn GenerativeBackend>,
        normalizer: ImageNormalizer,
    ) -> Self {
        Self {
            deck,
            backend,
            normalizer,
        }
    }

    /// Replay `context` on every slide of `targets` concurrently
    ///
    /// A context with a style reference goes through the reference-guided
    /// remake; otherwise the variation call with the stored model. Each
    /// target is edited from its own current rendering. Failures are
    /// per slide and never roll back slides already committed.
    pub async fn propagate(
        &self,
        context: &LastSuccessfulEditContext,
        targets: Vec<Slide>,
    ) -> PropagationReport {
        tracing::info!(
            targets = targets.len(),
            remake = context.style_reference().is_some(),
            "propagating edit"
        );

        let units = targets.iter().map(|slide| async move {
            self.propagate_one(context, slide)
                .await
                .map(|()| slide.id().clone())
                .map_err(|error| {
                    let failure =
                        UnitFailure::new(slide.id().clone(), Some(slide.name().to_string()), error);
                    tracing::error!(
                        slide_id = %failure.target,
                        slide = slide.name(),
                        error = %failure.error,
                        "propagation failed"
                    );
                    failure
                })
        });

        let mut report = PropagationReport::default();
        for outcome in futures::future::join_all(units).await {
            match outcome {
                Ok(id) => report.committed.push(id),
                Err(failure) => report.failures.push(failure),
            }
        }

        tracing::info!(
            committed = report.committed.len(),
            failed = report.failures.len(),
            "propagation finished"
        );
        report
    }

    async fn propagate_one(
        &self,
        context: &LastSuccessfulEditContext,
        slide: &Slide,
    ) -> Result<(), EngineError> {
        let base = slide.current();
        let prompt = &context.user_intent_prompt;

        let images = match context.style_reference() {
            Some(reference) => {
                self.backend
                    .remake_with_reference(
                        prompt,
                        base,
                        std::slice::from_ref(reference),
                        context.deep_mode,
                    )
                    .await?
            }
            None => {
                self.backend
                    .generate_variations(&context.model, prompt, base, context.deep_mode)
                    .await?
            }
        };

        let first: &ImageRef = images.first().ok_or(BackendError::NoCandidates)?;
        let image = self.normalizer.normalize(first).await?;
        self.deck.replace_slide_rendering(slide.id(), image).await?;
        Ok(())
    }
}
