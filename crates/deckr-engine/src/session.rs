//! Editing session
//!
//! Ties the components to one deck and holds the per-session focus: the
//! active slide, add-slide mode, the plan being executed and the context of
//! the last accepted single-slide edit. Focus state lives behind a
//! `parking_lot` mutex that is never held across an await.

use crate::backend::{BoundedBackend, GenerativeBackend, PlanGenerator};
use crate::config::EngineConfig;
use crate::coordinator::{ExecutionReport, TaskCoordinator};
use crate::deck::{DeckHandle, PendingWrite};
use crate::error::{EngineError, ReviewError};
use crate::normalizer::ImageNormalizer;
use crate::plan::{validate_plan, ValidatedPlan};
use crate::propagation::{EditPropagator, PropagationReport};
use crate::review::{OpenOutcome, ReviewController, ReviewState};
use crate::types::{EditRequest, LastSuccessfulEditContext, NormalizedImage, Slide, SlideId};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Focus {
    active_slide: Option<SlideId>,
    adding_slide: bool,
    last_edit: Option<LastSuccessfulEditContext>,
    /// Most recently submitted plan still running, keyed by submission
    current_plan: Option<(u64, ValidatedPlan)>,
    plans_submitted: u64,
}

impl Focus {
    fn activate(&mut self, id: Option<SlideId>) {
        if self.active_slide != id {
            if self.last_edit.take().is_some() {
                tracing::debug!("active slide changed, edit context dropped");
            }
            self.active_slide = id;
        }
    }
}

/// One editing session over one deck
pub struct EditSession {
    deck: DeckHandle,
    planner: Arc<dyn PlanGenerator>,
    coordinator: TaskCoordinator,
    review: ReviewController,
    propagator: EditPropagator,
    focus: Mutex<Focus>,
}

impl std::fmt::Debug for EditSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditSession")
            .field("focus", &*self.focus.lock())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl EditSession {
    /// Start a session over `slides`
    ///
    /// The backend is wrapped in [`BoundedBackend`] and shared by every
    /// component. Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns `Config` if `config` is invalid.
    pub fn new(
        config: &EngineConfig,
        slides: Vec<Slide>,
        planner: Arc<dyn PlanGenerator>,
        backend: Arc<dyn GenerativeBackend>,
    ) -> Result<Self, EngineError> {
        Self::with_normalizer(config, slides, planner, backend, ImageNormalizer::new(config))
    }

    /// Start a session with a custom normalizer
    ///
    /// # Errors
    /// Returns `Config` if `config` is invalid.
    pub fn with_normalizer(
        config: &EngineConfig,
        slides: Vec<Slide>,
        planner: Arc<dyn PlanGenerator>,
        backend: Arc<dyn GenerativeBackend>,
        normalizer: ImageNormalizer,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let deck = DeckHandle::spawn(slides, config.store_channel_capacity);
        let backend: Arc<dyn GenerativeBackend> = Arc::new(BoundedBackend::new(backend, config));

        Ok(Self {
            coordinator: TaskCoordinator::new(
                deck.clone(),
                Arc::clone(&backend),
                normalizer.clone(),
                config.default_new_slide_name.clone(),
            ),
            review: ReviewController::new(deck.clone(), Arc::clone(&backend), normalizer.clone()),
            propagator: EditPropagator::new(deck.clone(), backend, normalizer),
            deck,
            planner,
            focus: Mutex::new(Focus::default()),
        })
    }

    /// Deck store handle
    #[inline]
    #[must_use]
    pub fn deck(&self) -> &DeckHandle {
        &self.deck
    }

    /// Currently active slide
    #[must_use]
    pub fn active_slide(&self) -> Option<SlideId> {
        self.focus.lock().active_slide.clone()
    }

    /// Whether add-slide mode is on
    #[must_use]
    pub fn is_adding_slide(&self) -> bool {
        self.focus.lock().adding_slide
    }

    /// Plan currently executing
    ///
    /// With overlapping submissions this is the latest one, until it
    /// finishes.
    #[must_use]
    pub fn current_plan(&self) -> Option<ValidatedPlan> {
        self.focus.lock().current_plan.as_ref().map(|(_, plan)| plan.clone())
    }

    /// Context of the last accepted single-slide edit
    #[must_use]
    pub fn last_edit(&self) -> Option<LastSuccessfulEditContext> {
        self.focus.lock().last_edit.clone()
    }

    /// Plan targets still running
    #[must_use]
    pub fn in_flight(&self) -> Vec<SlideId> {
        self.coordinator.in_flight()
    }

    /// Review state of a slide
    ///
    /// # Errors
    /// `ReferenceNotFound` if the slide is gone.
    pub async fn review_state(&self, id: &SlideId) -> Result<ReviewState, EngineError> {
        self.review.state(id).await
    }

    /// Turn a natural-language request into a plan and execute it
    ///
    /// # Errors
    /// - `Backend` if the planner fails
    /// - `Plan` if its output is rejected
    pub async fn submit_request(
        &self,
        request: &str,
        deep_mode: bool,
    ) -> Result<ExecutionReport, EngineError> {
        let summaries = self.deck.summaries().await?;
        let raw = self
            .planner
            .generate_plan(request, &summaries)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "plan generation failed");
                e
            })?;
        self.submit_plan(&raw, deep_mode).await
    }

    /// Validate and execute an externally generated plan
    ///
    /// A rejected plan clears the current plan and touches nothing.
    ///
    /// # Errors
    /// `Plan` if the plan is rejected.
    pub async fn submit_plan(
        &self,
        raw: &serde_json::Value,
        deep_mode: bool,
    ) -> Result<ExecutionReport, EngineError> {
        let plan = match validate_plan(raw) {
            Ok(plan) => plan,
            Err(error) => {
                self.focus.lock().current_plan = None;
                tracing::warn!(error = %error, "plan rejected");
                return Err(error.into());
            }
        };

        let submission = {
            let mut focus = self.focus.lock();
            focus.plans_submitted += 1;
            focus.current_plan = Some((focus.plans_submitted, plan.clone()));
            focus.plans_submitted
        };
        let report = self.coordinator.execute(&plan, deep_mode).await;

        {
            let mut focus = self.focus.lock();
            if focus.current_plan.as_ref().is_some_and(|(n, _)| *n == submission) {
                focus.current_plan = None;
            }
        }
        report
    }

    /// Make `id` the active slide, opening its pending bundle if any
    ///
    /// Changing the active slide drops the edit context. Pending bundles on
    /// other slides are untouched.
    ///
    /// # Errors
    /// `ReferenceNotFound` if the slide is gone.
    pub async fn select_slide(&self, id: &SlideId) -> Result<OpenOutcome, EngineError> {
        let outcome = self.review.open(id).await?;
        let mut focus = self.focus.lock();
        focus.activate(Some(id.clone()));
        focus.adding_slide = false;
        Ok(outcome)
    }

    /// Switch to add-slide mode, leaving no slide active
    pub fn enter_add_slide_mode(&self) {
        let mut focus = self.focus.lock();
        focus.activate(None);
        focus.adding_slide = true;
    }

    /// Run a single-slide edit on the active slide
    ///
    /// # Errors
    /// - `Review(NoActiveSlide)` without an active slide
    /// - `Unit` for a failure scoped to the slide
    pub async fn request_edit(&self, request: EditRequest) -> Result<PendingWrite, EngineError> {
        let id = self.require_active()?;
        Ok(self.review.request_edit(&id, request).await?)
    }

    /// Open the active slide's bundle again (after a newer bundle landed)
    ///
    /// # Errors
    /// `Review(NoActiveSlide)` without an active slide.
    pub async fn reopen(&self) -> Result<OpenOutcome, EngineError> {
        let id = self.require_active()?;
        self.review.open(&id).await
    }

    /// Confirm candidate `index` on the active slide
    ///
    /// Single-slide edits become the edit context for [`Self::apply_to_all`].
    ///
    /// # Errors
    /// - `Review(NoActiveSlide)` without an active slide
    /// - `Review` or `Deck` if the slide is not under review
    pub async fn confirm(
        &self,
        index: usize,
    ) -> Result<Option<LastSuccessfulEditContext>, EngineError> {
        let id = self.require_active()?;
        let context = self.review.confirm(&id, index).await?;
        if let Some(context) = &context {
            let mut focus = self.focus.lock();
            if focus.active_slide.as_ref() == Some(&id) {
                focus.last_edit = Some(context.clone());
            }
        }
        Ok(context)
    }

    /// Discard the active slide's bundle
    ///
    /// # Errors
    /// - `Review(NoActiveSlide)` without an active slide
    /// - `Review` if the slide is not under review
    pub async fn discard(&self) -> Result<(), EngineError> {
        let id = self.require_active()?;
        self.review.discard(&id).await
    }

    /// Regenerate the active slide's bundle
    ///
    /// # Errors
    /// - `Review(NoActiveSlide)` without an active slide
    /// - `Unit` for a failure scoped to the slide
    pub async fn regenerate(&self, deep_mode: bool) -> Result<PendingWrite, EngineError> {
        let id = self.require_active()?;
        Ok(self.review.regenerate(&id, deep_mode).await?)
    }

    /// Replay the last accepted edit on every slide but the active one
    ///
    /// The context is consumed even if some slides fail.
    ///
    /// # Errors
    /// `Review(NoEditContext)` if nothing was confirmed since the active
    /// slide last changed.
    pub async fn apply_to_all(&self) -> Result<PropagationReport, EngineError> {
        let (context, active) = {
            let mut focus = self.focus.lock();
            let context = focus.last_edit.take().ok_or(ReviewError::NoEditContext)?;
            (context, focus.active_slide.clone())
        };

        let targets = self
            .deck
            .snapshot()
            .await?
            .into_iter()
            .filter(|slide| Some(slide.id()) != active.as_ref())
            .collect();
        Ok(self.propagator.propagate(&context, targets).await)
    }

    /// Drop the active slide's current rendering
    ///
    /// # Errors
    /// - `Review(NoActiveSlide)` without an active slide
    /// - `Deck(NothingToUndo)` if only the first rendering is left
    pub async fn undo(&self) -> Result<NormalizedImage, EngineError> {
        let id = self.require_active()?;
        Ok(self.deck.undo(&id).await?)
    }

    /// Remove a slide from the deck
    ///
    /// # Errors
    /// `ReferenceNotFound` if the slide is gone.
    pub async fn delete_slide(&self, id: &SlideId) -> Result<Slide, EngineError> {
        let removed = self.deck.delete_slide(id).await?;
        let mut focus = self.focus.lock();
        if focus.active_slide.as_ref() == Some(id) {
            focus.activate(None);
        }
        tracing::info!(slide = %id, "slide deleted");
        Ok(removed)
    }

    /// Stop the deck store
    pub async fn shutdown(&self) {
        self.deck.shutdown().await;
    }

    fn require_active(&self) -> Result<SlideId, EngineError> {
        self.focus
            .lock()
            .active_slide
            .clone()
            .ok_or_else(|| ReviewError::NoActiveSlide.into())
    }
}
