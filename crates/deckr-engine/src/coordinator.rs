//! Task execution coordinator
//!
//! Runs every task of a validated plan concurrently against the generative
//! backend. Each task is a unit:
//! - an `EDIT_SLIDE` unit attaches a pending bundle to its slide
//! - an `ADD_SLIDE` unit synthesizes a new slide carrying a pending bundle
//!
//! A unit's failure is recorded against its target id and never aborts its
//! siblings. Completion is the join of all units.

use crate::backend::{CreationExtras, GenerativeBackend, Generation};
use crate::deck::{DeckHandle, PendingWrite};
use crate::error::{BackendError, EngineError, UnitFailure};
use crate::normalizer::ImageNormalizer;
use crate::plan::{PlanTask, ValidatedPlan};
use crate::types::{NormalizedImage, PendingOrigin, PendingPersonalization, Slide, SlideId};
use dashmap::DashMap;
use std::sync::Arc;

/// Successful unit result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSuccess {
    /// Pending bundle attached to an existing slide
    PendingAttached {
        /// Edited slide
        slide: SlideId,
        /// Number of candidates
        variations: usize,
    },
    /// A newer pending write already landed on the slide
    Superseded {
        /// Edited slide
        slide: SlideId,
    },
    /// New slide inserted
    SlideAdded {
        /// New slide id
        slide: SlideId,
        /// Anchor it was inserted after
        insert_after: SlideId,
        /// Landing index in the deck
        index: usize,
        /// Number of candidates
        variations: usize,
    },
}

impl UnitSuccess {
    /// Slide the unit wrote to
    #[must_use]
    pub fn slide(&self) -> &SlideId {
        match self {
            Self::PendingAttached { slide, .. }
            | Self::Superseded { slide }
            | Self::SlideAdded { slide, .. } => slide,
        }
    }
}

/// Outcome of executing a plan
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// One entry per task, in plan order
    pub outcomes: Vec<Result<UnitSuccess, UnitFailure>>,
}

impl ExecutionReport {
    /// Successful units
    pub fn successes(&self) -> impl Iterator<Item = &UnitSuccess> {
        self.outcomes.iter().filter_map(|o| o.as_ref().ok())
    }

    /// Failed units
    pub fn failures(&self) -> impl Iterator<Item = &UnitFailure> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }

    /// Target ids of failed units
    #[must_use]
    pub fn failed_targets(&self) -> Vec<&SlideId> {
        self.failures().map(|f| &f.target).collect()
    }

    /// Ids of slides created by `ADD_SLIDE` units
    #[must_use]
    pub fn added_slides(&self) -> Vec<&SlideId> {
        self.successes()
            .filter_map(|s| match s {
                UnitSuccess::SlideAdded { slide, .. } => Some(slide),
                _ => None,
            })
            .collect()
    }

    /// Whether every unit succeeded
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(Result::is_ok)
    }
}

/// Marks a target in flight for as long as it lives
struct InFlightGuard {
    map: Arc<DashMap<SlideId, usize>>,
    id: SlideId,
}

impl InFlightGuard {
    fn enter(map: &Arc<DashMap<SlideId, usize>>, id: SlideId) -> Self {
        *map.entry(id.clone()).or_insert(0) += 1;
        Self {
            map: Arc::clone(map),
            id,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.map.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
        self.map.remove_if(&self.id, |_, count| *count == 0);
    }
}

/// Task execution coordinator
#[derive(Clone)]
pub struct TaskCoordinator {
    deck: DeckHandle,
    backend: Arc<dyn GenerativeBackend>,
    normalizer: ImageNormalizer,
    in_flight: Arc<DashMap<SlideId, usize>>,
    default_slide_name: String,
}

impl std::fmt::Debug for TaskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCoordinator")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl TaskCoordinator {
    /// Create new coordinator
    #[must_use]
    pub fn new(
        deck: DeckHandle,
        backend: Arc<dyn GenerativeBackend>,
        normalizer: ImageNormalizer,
        default_slide_name: impl Into<String>,
    ) -> Self {
        Self {
            deck,
            backend,
            normalizer,
            in_flight: Arc::new(DashMap::new()),
            default_slide_name: default_slide_name.into(),
        }
    }

    /// Target ids with a unit still running
    #[must_use]
    pub fn in_flight(&self) -> Vec<SlideId> {
        let mut ids: Vec<SlideId> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Whether a unit targeting `id` is running
    #[must_use]
    pub fn is_in_flight(&self, id: &SlideId) -> bool {
        self.in_flight.contains_key(id)
    }

    /// Execute every task of `plan` concurrently
    ///
    /// Returns once all units have settled; no target of this plan remains
    /// in flight afterwards.
    ///
    /// # Errors
    /// Only a closed deck store fails the whole plan. Unit errors are
    /// reported in the [`ExecutionReport`].
    pub async fn execute(
        &self,
        plan: &ValidatedPlan,
        deep_mode: bool,
    ) -> Result<ExecutionReport, EngineError> {
        let slides = self.deck.snapshot().await?;
        tracing::info!(tasks = plan.len(), slides = slides.len(), deep_mode, "executing plan");

        let units = plan.tasks().iter().map(|task| {
            let guard = InFlightGuard::enter(&self.in_flight, task.target().clone());
            let slides = &slides;
            async move {
                let _guard = guard;
                self.run_unit(task, slides, deep_mode).await
            }
        });
        let outcomes = futures::future::join_all(units).await;

        let report = ExecutionReport { outcomes };
        tracing::info!(
            succeeded = report.successes().count(),
            failed = report.failures().count(),
            "plan finished"
        );
        Ok(report)
    }

    async fn run_unit(
        &self,
        task: &PlanTask,
        slides: &[Slide],
        deep_mode: bool,
    ) -> Result<UnitSuccess, UnitFailure> {
        tracing::debug!(task = task.tag(), slide_id = %task.target(), "dispatching unit");

        let (result, slide_name) = match task {
            PlanTask::EditSlide {
                slide_id,
                detailed_prompt,
            } => {
                let name = slides
                    .iter()
                    .find(|s| s.id() == slide_id)
                    .map(|s| s.name().to_string());
                let result = self.edit_unit(slide_id, detailed_prompt, slides, deep_mode).await;
                (result, name)
            }
            PlanTask::AddSlide {
                insert_after,
                new_slide_name,
                detailed_prompt,
            } => {
                let name = new_slide_name
                    .clone()
                    .unwrap_or_else(|| self.default_slide_name.clone());
                let result = self
                    .add_unit(insert_after, &name, detailed_prompt, slides, deep_mode)
                    .await;
                (result, Some(name))
            }
        };

        result.map_err(|error| {
            let failure = UnitFailure::new(task.target().clone(), slide_name, error);
            tracing::error!(
                slide_id = %failure.target,
                slide = failure.slide_name.as_deref().unwrap_or_default(),
                error = %failure.error,
                "unit failed"
            );
            failure
        })
    }

    async fn edit_unit(
        &self,
        slide_id: &SlideId,
        prompt: &str,
        slides: &[Slide],
        deep_mode: bool,
    ) -> Result<UnitSuccess, EngineError> {
        let slide = slides
            .iter()
            .find(|s| s.id() == slide_id)
            .ok_or_else(|| EngineError::ReferenceNotFound(slide_id.clone()))?;

        let stamp = self.deck.reserve_stamp().await?;
        let result: Result<UnitSuccess, EngineError> = async {
            let generation = self
                .backend
                .edit_slide(slide.current(), prompt, deep_mode)
                .await?;
            let pending = self.pending_bundle(generation, prompt, stamp).await?;
            let variations = pending.len();

            match self.deck.set_pending(slide_id, Some(pending), stamp).await? {
                PendingWrite::Applied => Ok(UnitSuccess::PendingAttached {
                    slide: slide_id.clone(),
                    variations,
                }),
                PendingWrite::Superseded { .. } => Ok(UnitSuccess::Superseded {
                    slide: slide_id.clone(),
                }),
            }
        }
        .await;

        if result.is_err() {
            clear_after_failure(&self.deck, slide_id, stamp).await;
        }
        result
    }

    async fn add_unit(
        &self,
        insert_after: &SlideId,
        name: &str,
        prompt: &str,
        slides: &[Slide],
        deep_mode: bool,
    ) -> Result<UnitSuccess, EngineError> {
        let reference = slides.first().ok_or(EngineError::EmptyDeck)?;
        let extras = CreationExtras {
            slide_name: name.to_string(),
            insert_after: insert_after.clone(),
        };

        let stamp = self.deck.reserve_stamp().await?;
        let generation = self
            .backend
            .create_slide(reference.current(), prompt, deep_mode, &extras)
            .await?;
        let pending = self.pending_bundle(generation, prompt, stamp).await?;
        let variations = pending.len();

        let first = pending.variations[0].clone();
        let slide = Slide::new(SlideId::generate(), name, first).with_pending(pending);
        let id = slide.id().clone();
        let index = self.deck.add_slide(slide, insert_after).await?;

        Ok(UnitSuccess::SlideAdded {
            slide: id,
            insert_after: insert_after.clone(),
            index,
            variations,
        })
    }

    async fn pending_bundle(
        &self,
        generation: Generation,
        prompt: &str,
        stamp: u64,
    ) -> Result<PendingPersonalization, EngineError> {
        let (variations, prompts) = normalized_candidates(&self.normalizer, generation, prompt).await?;
        PendingPersonalization::new(prompt, variations, prompts, PendingOrigin::Plan, stamp)
            .ok_or_else(|| BackendError::NoCandidates.into())
    }
}

/// Drop a slide's pending bundle after its producer failed
///
/// Stamp-guarded: a bundle written by a newer producer stays.
pub(crate) async fn clear_after_failure(deck: &DeckHandle, id: &SlideId, stamp: u64) {
    match deck.set_pending(id, None, stamp).await {
        Ok(PendingWrite::Applied) => {
            tracing::debug!(slide = %id, stamp, "pending cleared after failure");
        }
        Ok(PendingWrite::Superseded { current }) => {
            tracing::debug!(slide = %id, stamp, current, "newer pending kept after failure");
        }
        Err(error) => {
            tracing::warn!(slide = %id, error = %error, "could not clear pending after failure");
        }
    }
}

/// Normalize a generation into parallel image and prompt lists
///
/// # Errors
/// - `Backend(NoCandidates)` if the generation is empty
/// - `Normalization` if no candidate survives normalization
pub(crate) async fn normalized_candidates(
    normalizer: &ImageNormalizer,
    generation: Generation,
    prompt: &str,
) -> Result<(Vec<NormalizedImage>, Vec<String>), EngineError> {
    if generation.images.is_empty() {
        return Err(BackendError::NoCandidates.into());
    }
    let kept = normalizer
        .normalize_candidates(generation.paired(prompt))
        .await?;
    Ok(kept.into_iter().unzip())
}
