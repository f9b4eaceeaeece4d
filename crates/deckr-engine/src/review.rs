//! Personalization review
//!
//! Per-slide state machine over the pending bundle:
//!
//! ```text
//! Idle -> Pending -> UnderReview -> { Confirmed | Discarded | Regenerating }
//!                                                             |
//!                                    Pending <----------------+
//! ```
//!
//! The deck store holds the bundle itself; the controller only remembers
//! which bundle (by stamp) a human has opened and which slides are
//! regenerating. A state is derived from both, so a slide cannot be
//! `UnderReview` and `Pending` at once: once a newer bundle lands, the slide
//! is `Pending` again and has to be reopened.

use crate::backend::{GenerativeBackend, Generation};
use crate::coordinator::{clear_after_failure, normalized_candidates};
use crate::deck::{DeckHandle, PendingWrite};
use crate::error::{BackendError, EngineError, ReviewError, UnitFailure};
use crate::normalizer::ImageNormalizer;
use crate::types::{
    EditRequest, EditWorkflow, LastSuccessfulEditContext, PendingOrigin, PendingPersonalization,
    Slide, SlideId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Review state of one slide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewState {
    /// No pending bundle
    Idle,
    /// Bundle attached, not yet opened
    Pending,
    /// Bundle opened by a human
    UnderReview,
    /// New candidates are being generated
    Regenerating,
    /// A candidate was committed to history
    Confirmed,
    /// The bundle was dropped
    Discarded,
}

/// Validates a review transition
///
/// # Errors
/// Returns `ReviewError::IllegalTransition` if `to` is not reachable from
/// `from`.
pub fn validate_transition(
    slide: &SlideId,
    from: ReviewState,
    to: ReviewState,
) -> Result<(), ReviewError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(ReviewError::IllegalTransition {
            slide: slide.clone(),
            from,
            to,
        })
    }
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: ReviewState) -> Vec<ReviewState> {
    use ReviewState::*;
    match from {
        Idle => vec![Pending],
        Pending => vec![Pending, UnderReview],
        UnderReview => vec![Pending, Confirmed, Discarded, Regenerating],
        Regenerating => vec![Pending, Idle],
        Confirmed | Discarded => vec![Idle],
    }
}

fn allowed(from: ReviewState, to: ReviewState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

/// Result of opening a slide
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// Bundle is now under review
    UnderReview(PendingPersonalization),
    /// Nothing to review; the slide just becomes active
    Activated,
    /// Candidates are being regenerated
    Regenerating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reviewing { stamp: u64 },
    Regenerating,
}

/// Personalization review controller
#[derive(Clone)]
pub struct ReviewController {
    deck: DeckHandle,
    backend: Arc<dyn GenerativeBackend>,
    normalizer: ImageNormalizer,
    phases: Arc<Mutex<HashMap<SlideId, Phase>>>,
}

impl std::fmt::Debug for ReviewController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewController")
            .field("phases", &self.phases.lock().len())
            .finish_non_exhaustive()
    }
}

impl ReviewController {
    /// Create new controller
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
            phases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current review state of a slide
    ///
    /// # Errors
    /// `ReferenceNotFound` if the slide is gone.
    pub async fn state(&self, id: &SlideId) -> Result<ReviewState, EngineError> {
        Ok(self.observe(id).await?.0)
    }

    /// Run a single-slide edit and attach its candidates for review
    ///
    /// The remake workflow goes through `remake_with_reference` with the
    /// style reference; the generic workflow through `edit_slide`. Both edit
    /// the slide's current rendering.
    ///
    /// # Errors
    /// Any failure is scoped to the slide. Once generation has started, a
    /// failure also clears the slide's pending bundle unless a newer
    /// producer replaced it meanwhile.
    pub async fn request_edit(
        &self,
        id: &SlideId,
        request: EditRequest,
    ) -> Result<PendingWrite, UnitFailure> {
        let mut name = None;
        let mut stamp = None;
        let result = async {
            let (state, slide) = self.observe(id).await?;
            name = Some(slide.name().to_string());
            validate_transition(id, state, ReviewState::Pending)?;

            let reserved = self.deck.reserve_stamp().await?;
            stamp = Some(reserved);
            let generation = self.single_slide_generation(&slide, &request).await?;
            let (variations, prompts) =
                normalized_candidates(&self.normalizer, generation, &request.prompt).await?;
            let prompt = request.prompt.clone();
            let pending = PendingPersonalization::new(
                prompt,
                variations,
                prompts,
                PendingOrigin::SingleSlide(request),
                reserved,
            )
            .ok_or(BackendError::NoCandidates)?;

            self.attach(id, pending, reserved).await
        }
        .await;

        if let (Err(_), Some(stamp)) = (&result, stamp) {
            self.phases.lock().remove(id);
            clear_after_failure(&self.deck, id, stamp).await;
        }
        result.map_err(|error| self.failure(id, name, error))
    }

    /// Open a slide for review
    ///
    /// # Errors
    /// `ReferenceNotFound` if the slide is gone.
    pub async fn open(&self, id: &SlideId) -> Result<OpenOutcome, EngineError> {
        let (state, slide) = self.observe(id).await?;
        match (state, slide.pending()) {
            (ReviewState::Pending | ReviewState::UnderReview, Some(pending)) => {
                if state == ReviewState::Pending {
                    validate_transition(id, state, ReviewState::UnderReview)?;
                    self.phases.lock().insert(
                        id.clone(),
                        Phase::Reviewing {
                            stamp: pending.stamp,
                        },
                    );
                    tracing::debug!(slide = %id, stamp = pending.stamp, "review opened");
                }
                Ok(OpenOutcome::UnderReview(pending.clone()))
            }
            (ReviewState::Regenerating, _) => Ok(OpenOutcome::Regenerating),
            _ => Ok(OpenOutcome::Activated),
        }
    }

    /// Commit candidate `index` of the bundle under review
    ///
    /// Returns the edit context when the bundle came from a single-slide
    /// request; plan results yield `None`.
    ///
    /// # Errors
    /// - `Review(IllegalTransition)` if the slide is not under review
    /// - `Review(CandidateOutOfRange)` for a bad index
    /// - `Deck(StalePending)` if the bundle was replaced meanwhile
    pub async fn confirm(
        &self,
        id: &SlideId,
        index: usize,
    ) -> Result<Option<LastSuccessfulEditContext>, EngineError> {
        let (state, slide) = self.observe(id).await?;
        validate_transition(id, state, ReviewState::Confirmed)?;
        let pending = slide
            .pending()
            .ok_or_else(|| ReviewError::IllegalTransition {
                slide: id.clone(),
                from: ReviewState::Idle,
                to: ReviewState::Confirmed,
            })?;

        let image = pending
            .variations
            .get(index)
            .cloned()
            .ok_or(ReviewError::CandidateOutOfRange {
                index,
                available: pending.len(),
            })?;

        self.deck.confirm(id, image, pending.stamp).await?;
        self.phases.lock().remove(id);
        tracing::info!(slide = %id, index, "candidate confirmed");

        Ok(match &pending.origin {
            PendingOrigin::SingleSlide(request) => Some(request.clone().into()),
            PendingOrigin::Plan => None,
        })
    }

    /// Drop the bundle under review
    ///
    /// # Errors
    /// `Review(IllegalTransition)` if the slide is not under review.
    pub async fn discard(&self, id: &SlideId) -> Result<(), EngineError> {
        let (state, _) = self.observe(id).await?;
        validate_transition(id, state, ReviewState::Discarded)?;

        self.deck.discard(id).await?;
        self.phases.lock().remove(id);
        tracing::info!(slide = %id, "pending personalization discarded");
        Ok(())
    }

    /// Replace the bundle under review with fresh candidates
    ///
    /// Candidates are generated from the slide's first rendering with the
    /// bundle's original prompt. On failure the slide is left with no
    /// pending bundle.
    ///
    /// # Errors
    /// Any failure is scoped to the slide.
    pub async fn regenerate(
        &self,
        id: &SlideId,
        deep_mode: bool,
    ) -> Result<PendingWrite, UnitFailure> {
        let (state, slide) = match self.observe(id).await {
            Ok(observed) => observed,
            Err(error) => return Err(self.failure(id, None, error)),
        };
        let name = Some(slide.name().to_string());
        let pending = match validate_transition(id, state, ReviewState::Regenerating)
            .map_err(EngineError::from)
            .and_then(|()| {
                slide.pending().cloned().ok_or_else(|| {
                    EngineError::from(ReviewError::IllegalTransition {
                        slide: id.clone(),
                        from: ReviewState::Idle,
                        to: ReviewState::Regenerating,
                    })
                })
            }) {
            Ok(pending) => pending,
            Err(error) => return Err(self.failure(id, name, error)),
        };

        self.phases.lock().insert(id.clone(), Phase::Regenerating);
        let deep_mode = match &pending.origin {
            PendingOrigin::SingleSlide(request) => request.deep_mode,
            PendingOrigin::Plan => deep_mode,
        };

        let mut stamp = None;
        let result = async {
            let reserved = self.deck.reserve_stamp().await?;
            stamp = Some(reserved);
            let generation = self
                .backend
                .edit_slide(slide.first_rendering(), &pending.task_prompt, deep_mode)
                .await?;
            let (variations, prompts) =
                normalized_candidates(&self.normalizer, generation, &pending.task_prompt).await?;
            let fresh = PendingPersonalization::new(
                pending.task_prompt.clone(),
                variations,
                prompts,
                pending.origin.clone(),
                reserved,
            )
            .ok_or(BackendError::NoCandidates)?;
            self.deck
                .set_pending(id, Some(fresh), reserved)
                .await
                .map_err(EngineError::from)
        }
        .await;
        self.phases.lock().remove(id);

        match result {
            Ok(write) => {
                tracing::info!(slide = %id, ?write, "candidates regenerated");
                Ok(write)
            }
            Err(error) => {
                if let Some(stamp) = stamp {
                    clear_after_failure(&self.deck, id, stamp).await;
                }
                Err(self.failure(id, name, error))
            }
        }
    }

    async fn single_slide_generation(
        &self,
        slide: &Slide,
        request: &EditRequest,
    ) -> Result<Generation, EngineError> {
        let base = slide.current();
        let generation = match &request.workflow {
            EditWorkflow::Generate => {
                self.backend
                    .edit_slide(base, &request.prompt, request.deep_mode)
                    .await?
            }
            EditWorkflow::Remake { style_reference } => {
                let images = self
                    .backend
                    .remake_with_reference(
                        &request.prompt,
                        base,
                        std::slice::from_ref(style_reference),
                        request.deep_mode,
                    )
                    .await?;
                Generation::new(images, Vec::new())
            }
        };
        Ok(generation)
    }

    async fn attach(
        &self,
        id: &SlideId,
        pending: PendingPersonalization,
        stamp: u64,
    ) -> Result<PendingWrite, EngineError> {
        let variations = pending.len();
        let write = self.deck.set_pending(id, Some(pending), stamp).await?;
        if write == PendingWrite::Applied {
            self.phases.lock().remove(id);
            tracing::info!(slide = %id, variations, "single-slide candidates attached");
        }
        Ok(write)
    }

    async fn observe(&self, id: &SlideId) -> Result<(ReviewState, Slide), EngineError> {
        let slide = self.deck.require_slide(id).await?;
        let phase = self.phases.lock().get(id).copied();
        let state = match (phase, slide.pending()) {
            (Some(Phase::Regenerating), _) => ReviewState::Regenerating,
            (Some(Phase::Reviewing { stamp }), Some(pending)) if pending.stamp == stamp => {
                ReviewState::UnderReview
            }
            (_, Some(pending)) if !pending.is_empty() => ReviewState::Pending,
            _ => ReviewState::Idle,
        };
        Ok((state, slide))
    }

    fn failure(&self, id: &SlideId, name: Option<String>, error: EngineError) -> UnitFailure {
        let failure = UnitFailure::new(id.clone(), name, error);
        tracing::error!(
            slide_id = %failure.target,
            slide = failure.slide_name.as_deref().unwrap_or_default(),
            error = %failure.error,
            "review action failed"
        );
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGenerativeBackend;
    use crate::config::EngineConfig;
    use crate::normalizer::normalize_bytes;
    use crate::types::{ImageRef, NormalizedImage};
    use base64::Engine as _;

    fn png(shade: u8) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([shade, 0, 0, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn data_url(shade: u8) -> ImageRef {
        let payload = base64::engine::general_purpose::STANDARD.encode(png(shade));
        ImageRef::new(format!("data:image/png;base64,{payload}"))
    }

    fn normalized(shade: u8) -> NormalizedImage {
        normalize_bytes(&png(shade), u64::MAX).unwrap()
    }

    fn controller(backend: MockGenerativeBackend, slides: Vec<Slide>) -> ReviewController {
        let config = EngineConfig::default();
        ReviewController::new(
            DeckHandle::spawn(slides, 8),
            Arc::new(backend),
            ImageNormalizer::new(&config),
        )
    }

    fn pending(stamp: u64) -> PendingPersonalization {
        PendingPersonalization::new(
            "brighter",
            vec![normalized(10), normalized(20)],
            vec!["brighter".into(), "brighter".into()],
            PendingOrigin::Plan,
            stamp,
        )
        .unwrap()
    }

    #[test]
    fn transition_table() {
        let id = SlideId::new("a");
        assert!(validate_transition(&id, ReviewState::Idle, ReviewState::Pending).is_ok());
        assert!(validate_transition(&id, ReviewState::UnderReview, ReviewState::Confirmed).is_ok());
        assert!(validate_transition(&id, ReviewState::Regenerating, ReviewState::Pending).is_ok());
        assert_eq!(
            validate_transition(&id, ReviewState::Pending, ReviewState::Confirmed),
            Err(ReviewError::IllegalTransition {
                slide: id.clone(),
                from: ReviewState::Pending,
                to: ReviewState::Confirmed,
            })
        );
        assert!(validate_transition(&id, ReviewState::Idle, ReviewState::Discarded).is_err());
        assert_eq!(allowed_transitions(ReviewState::Confirmed), vec![ReviewState::Idle]);
    }

    #[tokio::test]
    async fn open_without_pending_only_activates() {
        let slide = Slide::new(SlideId::new("a"), "A", normalized(1));
        let review = controller(MockGenerativeBackend::new(), vec![slide]);

        let outcome = review.open(&SlideId::new("a")).await.unwrap();
        assert_eq!(outcome, OpenOutcome::Activated);
        assert_eq!(review.state(&SlideId::new("a")).await.unwrap(), ReviewState::Idle);
    }

    #[tokio::test]
    async fn confirm_requires_review() {
        let slide = Slide::new(SlideId::new("a"), "A", normalized(1)).with_pending(pending(1));
        let review = controller(MockGenerativeBackend::new(), vec![slide]);
        let id = SlideId::new("a");

        assert_eq!(review.state(&id).await.unwrap(), ReviewState::Pending);
        let err = review.confirm(&id, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Review(ReviewError::IllegalTransition { .. })));

        review.open(&id).await.unwrap();
        assert_eq!(review.state(&id).await.unwrap(), ReviewState::UnderReview);
        let err = review.confirm(&id, 5).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Review(ReviewError::CandidateOutOfRange { index: 5, available: 2 })
        ));

        assert_eq!(review.confirm(&id, 1).await.unwrap(), None);
        let slide = review.deck.require_slide(&id).await.unwrap();
        assert_eq!(slide.history().len(), 2);
        assert_eq!(slide.current(), &normalized(20));
        assert!(slide.pending().is_none());
    }

    #[tokio::test]
    async fn newer_bundle_sends_slide_back_to_pending() {
        let slide = Slide::new(SlideId::new("a"), "A", normalized(1)).with_pending(pending(1));
        let review = controller(MockGenerativeBackend::new(), vec![slide]);
        let id = SlideId::new("a");

        review.open(&id).await.unwrap();
        let stamp = review.deck.reserve_stamp().await.unwrap();
        review.deck.set_pending(&id, Some(pending(stamp)), stamp).await.unwrap();

        assert_eq!(review.state(&id).await.unwrap(), ReviewState::Pending);
        assert!(review.discard(&id).await.is_err());
    }

    #[tokio::test]
    async fn request_edit_remake_uses_style_reference() {
        let mut backend = MockGenerativeBackend::new();
        let reference = normalized(99);
        let expected = reference.clone();
        backend
            .expect_remake_with_reference()
            .withf(move |prompt, _, refs, deep| {
                prompt == "match brand" && refs.len() == 1 && refs[0] == expected && *deep
            })
            .times(1)
            .returning(|_, _, _, _| Ok(vec![data_url(5), data_url(6)]));

        let slide = Slide::new(SlideId::new("a"), "A", normalized(1));
        let review = controller(backend, vec![slide]);
        let id = SlideId::new("a");

        let request = EditRequest::remake("match brand", "m1", reference).with_deep_mode(true);
        let write = review.request_edit(&id, request.clone()).await.unwrap();
        assert_eq!(write, PendingWrite::Applied);

        review.open(&id).await.unwrap();
        let context = review.confirm(&id, 0).await.unwrap().unwrap();
        assert_eq!(context, LastSuccessfulEditContext::from(request));
        assert!(context.style_reference().is_some());
    }

    #[tokio::test]
    async fn failed_request_edit_drops_earlier_bundle() {
        let mut backend = MockGenerativeBackend::new();
        backend
            .expect_edit_slide()
            .times(1)
            .returning(|_, _, _| Err(BackendError::Failed("quota".into())));

        let slide = Slide::new(SlideId::new("a"), "Intro", normalized(1)).with_pending(pending(1));
        let review = controller(backend, vec![slide]);
        let id = SlideId::new("a");

        let failure = review
            .request_edit(&id, EditRequest::generate("warmer", "m1"))
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind(), crate::error::ErrorKind::GenerativeBackendFailure);
        assert!(review.deck.require_slide(&id).await.unwrap().pending().is_none());
        assert_eq!(review.state(&id).await.unwrap(), ReviewState::Idle);
    }

    #[tokio::test]
    async fn failed_regeneration_clears_pending() {
        let mut backend = MockGenerativeBackend::new();
        backend
            .expect_edit_slide()
            .times(1)
            .returning(|_, _, _| Err(BackendError::Failed("quota".into())));

        let slide = Slide::new(SlideId::new("a"), "Intro", normalized(1)).with_pending(pending(1));
        let review = controller(backend, vec![slide]);
        let id = SlideId::new("a");

        review.open(&id).await.unwrap();
        let failure = review.regenerate(&id, false).await.unwrap_err();
        assert_eq!(failure.target, id);
        assert_eq!(failure.slide_name.as_deref(), Some("Intro"));
        assert_eq!(review.state(&id).await.unwrap(), ReviewState::Idle);
    }
}
