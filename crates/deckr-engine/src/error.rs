//! Error types for the deck engine
//!
//! Provides error handling for:
//! - Plan rejection (structural and empty plans)
//! - Per-unit failures (missing slides, empty deck, backend, normalization)
//! - Deck store and review state machine violations
//! - Configuration loading

use crate::review::ReviewState;
use crate::types::SlideId;
use std::path::PathBuf;

/// Classification of engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Plan shape or tagging is wrong
    PlanStructurallyInvalid,
    /// Plan is well formed but has no tasks
    PlanHasNoActionableTasks,
    /// Referenced slide id does not exist
    ReferenceNotFound,
    /// No slide exists to anchor a creation
    EmptyDeck,
    /// Generative call failed or returned nothing
    GenerativeBackendFailure,
    /// Candidate image could not be normalized
    ImageNormalizationFailure,
    /// Deck store rejected an operation
    Deck,
    /// Review state machine rejected an operation
    Review,
    /// Bad configuration
    Config,
}

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Plan rejected before execution
    #[error("plan rejected: {0}")]
    Plan(#[from] PlanError),

    /// Slide id missing from the deck
    #[error("slide not found: {0}")]
    ReferenceNotFound(SlideId),

    /// No anchor slide for creation
    #[error("deck has no slides to use as a reference")]
    EmptyDeck,

    /// Generative backend failure
    #[error("generation failed: {0}")]
    Backend(#[from] BackendError),

    /// Image normalization failure
    #[error("image normalization failed: {0}")]
    Normalization(#[from] NormalizationError),

    /// Deck store error
    #[error("deck error: {0}")]
    Deck(DeckError),

    /// Review state machine error
    #[error("review error: {0}")]
    Review(#[from] ReviewError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failure scoped to one slide
    #[error(transparent)]
    Unit(Box<UnitFailure>),
}

impl EngineError {
    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Plan(PlanError::StructurallyInvalid { .. }) => ErrorKind::PlanStructurallyInvalid,
            Self::Plan(PlanError::NoActionableTasks) => ErrorKind::PlanHasNoActionableTasks,
            Self::ReferenceNotFound(_) => ErrorKind::ReferenceNotFound,
            Self::EmptyDeck => ErrorKind::EmptyDeck,
            Self::Backend(_) => ErrorKind::GenerativeBackendFailure,
            Self::Normalization(_) => ErrorKind::ImageNormalizationFailure,
            Self::Deck(_) => ErrorKind::Deck,
            Self::Review(_) => ErrorKind::Review,
            Self::Config(_) => ErrorKind::Config,
            Self::Unit(failure) => failure.error.kind(),
        }
    }

    /// Check if error is caught at the unit boundary
    ///
    /// Unit-scoped errors are attached to one slide and never abort siblings.
    #[inline]
    #[must_use]
    pub fn is_unit_scoped(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ReferenceNotFound
                | ErrorKind::EmptyDeck
                | ErrorKind::GenerativeBackendFailure
                | ErrorKind::ImageNormalizationFailure
        )
    }
}

impl From<UnitFailure> for EngineError {
    fn from(failure: UnitFailure) -> Self {
        Self::Unit(Box::new(failure))
    }
}

impl From<DeckError> for EngineError {
    fn from(error: DeckError) -> Self {
        match error {
            DeckError::SlideNotFound(id) => Self::ReferenceNotFound(id),
            other => Self::Deck(other),
        }
    }
}

/// Plan validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Plan failed shape checking
    #[error("{}", describe_invalid(.task_index, .reason))]
    StructurallyInvalid {
        /// Offending task, if the problem is inside one
        task_index: Option<usize>,
        /// What was wrong
        reason: String,
    },

    /// Well-formed plan with an empty task list
    #[error("plan has no actionable tasks")]
    NoActionableTasks,
}

impl PlanError {
    /// Plan-level structural error
    #[inline]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::StructurallyInvalid {
            task_index: None,
            reason: reason.into(),
        }
    }

    /// Task-level structural error
    #[inline]
    pub fn invalid_task(index: usize, reason: impl Into<String>) -> Self {
        Self::StructurallyInvalid {
            task_index: Some(index),
            reason: reason.into(),
        }
    }

    /// Message suitable for the person who made the request
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::StructurallyInvalid { .. } => {
                "The edit plan could not be understood. Please rephrase your request."
            }
            Self::NoActionableTasks => {
                "Nothing in the request maps to a slide change. Try naming a slide or describing a new one."
            }
        }
    }
}

fn describe_invalid(task_index: &Option<usize>, reason: &str) -> String {
    match task_index {
        Some(index) => format!("structurally invalid plan: task {index}: {reason}"),
        None => format!("structurally invalid plan: {reason}"),
    }
}

/// Generative backend errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Call failed
    #[error("backend call failed: {0}")]
    Failed(String),

    /// Call succeeded with zero candidates
    #[error("backend returned no candidates")]
    NoCandidates,

    /// Call exceeded the bounded wait
    #[error("backend call timed out after {duration_secs}s")]
    Timeout {
        /// Configured bound
        duration_secs: u64,
    },

    /// Backend cannot accept calls
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Image normalization errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    /// Source could not be fetched or decoded
    #[error("load failure: {0}")]
    LoadFailure(String),

    /// Rendering surface could not be acquired
    #[error("render context failure: {0}")]
    RenderContextFailure(String),
}

/// Deck store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeckError {
    /// Slide not in the deck
    #[error("slide not found: {0}")]
    SlideNotFound(SlideId),

    /// Confirm requested with nothing pending
    #[error("slide {0} has no pending personalization")]
    NoPendingPersonalization(SlideId),

    /// Displayed bundle was replaced before confirm
    #[error("pending personalization for {slide} changed (expected stamp {expected}, found {found})")]
    StalePending {
        /// Slide id
        slide: SlideId,
        /// Stamp the caller reviewed
        expected: u64,
        /// Stamp currently stored
        found: u64,
    },

    /// Only the first rendering is left
    #[error("slide {0} has no rendering to undo")]
    NothingToUndo(SlideId),

    /// Stored slide breaks a history invariant
    #[error("slide {slide} is malformed: {reason}")]
    InvalidSlide {
        /// Slide id
        slide: SlideId,
        /// Broken invariant
        reason: String,
    },

    /// Store actor has shut down
    #[error("deck store closed")]
    StoreClosed,
}

/// Review state machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    /// Transition not allowed from the current state
    #[error("illegal review transition for {slide}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Slide id
        slide: SlideId,
        /// Current state
        from: ReviewState,
        /// Requested state
        to: ReviewState,
    },

    /// Candidate index outside the bundle
    #[error("candidate {index} out of range ({available} available)")]
    CandidateOutOfRange {
        /// Requested index
        index: usize,
        /// Bundle size
        available: usize,
    },

    /// Session has no active slide
    #[error("no active slide")]
    NoActiveSlide,

    /// Nothing confirmed since the active slide changed
    #[error("no confirmed edit to apply")]
    NoEditContext,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config at '{path}': {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Malformed TOML
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Encoding failed
    #[error("cannot encode config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },
}

/// Failure of one unit (plan task, propagation target or review action)
///
/// Keyed by the slide id the unit targeted.
#[derive(Debug, thiserror::Error)]
#[error("{target}: {error}")]
pub struct UnitFailure {
    /// Target slide id (`slideId` or `insertAfterSlideId`)
    pub target: SlideId,
    /// Target slide name, when the slide was found
    pub slide_name: Option<String>,
    /// Cause
    #[source]
    pub error: EngineError,
}

impl UnitFailure {
    /// Create new unit failure
    #[inline]
    pub fn new(target: SlideId, slide_name: Option<String>, error: impl Into<EngineError>) -> Self {
        Self {
            target,
            slide_name,
            error: error.into(),
        }
    }

    /// Message scoped to the slide's name
    #[must_use]
    pub fn user_message(&self) -> String {
        let label = self.slide_name.as_deref().unwrap_or(self.target.as_str());
        format!("Couldn't update \"{label}\": {}", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_errors_have_distinct_kinds() {
        let invalid = EngineError::from(PlanError::invalid("missing tasks"));
        let empty = EngineError::from(PlanError::NoActionableTasks);

        assert_eq!(invalid.kind(), ErrorKind::PlanStructurallyInvalid);
        assert_eq!(empty.kind(), ErrorKind::PlanHasNoActionableTasks);
        assert_ne!(
            PlanError::invalid("x").user_message(),
            PlanError::NoActionableTasks.user_message()
        );
    }

    #[test]
    fn plan_error_display_names_task() {
        let err = PlanError::invalid_task(2, "unknown task type 'MOVE_SLIDE'");
        assert_eq!(
            err.to_string(),
            "structurally invalid plan: task 2: unknown task type 'MOVE_SLIDE'"
        );
    }

    #[test]
    fn missing_slide_maps_to_reference_not_found() {
        let err = EngineError::from(DeckError::SlideNotFound(SlideId::new("s9")));
        assert_eq!(err.kind(), ErrorKind::ReferenceNotFound);
        assert!(err.is_unit_scoped());

        let closed = EngineError::from(DeckError::StoreClosed);
        assert_eq!(closed.kind(), ErrorKind::Deck);
        assert!(!closed.is_unit_scoped());
    }

    #[test]
    fn unit_scope_classification() {
        assert!(EngineError::EmptyDeck.is_unit_scoped());
        assert!(EngineError::from(BackendError::NoCandidates).is_unit_scoped());
        assert!(
            EngineError::from(NormalizationError::LoadFailure("bad".into())).is_unit_scoped()
        );
        assert!(!EngineError::from(PlanError::NoActionableTasks).is_unit_scoped());
    }

    #[test]
    fn unit_failure_message_uses_slide_name() {
        let failure = UnitFailure::new(
            SlideId::new("s1"),
            Some("Pricing".into()),
            BackendError::Timeout { duration_secs: 300 },
        );
        assert_eq!(
            failure.user_message(),
            "Couldn't update \"Pricing\": generation failed: backend call timed out after 300s"
        );

        let anonymous = UnitFailure::new(SlideId::new("s2"), None, EngineError::EmptyDeck);
        assert!(anonymous.user_message().contains("\"s2\""));
    }

    #[test]
    fn wrapped_unit_failure_keeps_kind() {
        let failure = UnitFailure::new(
            SlideId::new("s1"),
            None,
            BackendError::Failed("quota".into()),
        );
        let err = EngineError::from(failure);
        assert_eq!(err.kind(), ErrorKind::GenerativeBackendFailure);
        assert!(err.is_unit_scoped());
        assert_eq!(err.to_string(), "s1: generation failed: backend call failed: quota");
    }
}
