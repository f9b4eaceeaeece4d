//! Core types for the deck engine
//!
//! Defines the fundamental domain types:
//! - Slide identifiers and image references
//! - Slides and their append-only rendering history
//! - Pending personalization bundles
//! - Single-slide edit requests and the captured edit context

use crate::error::{DeckError, NormalizationError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Unique slide identifier
///
/// Planner-supplied ids are arbitrary strings, so this wraps a `String`
/// rather than a typed id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlideId(String);

impl SlideId {
    /// Wrap an existing identifier
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh identifier for a synthesized slide
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("slide-{}", Ulid::new()))
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlideId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of raw image reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRefKind {
    /// `http://` or `https://` URL
    Remote,
    /// `data:` URL with an inline payload
    Inline,
    /// Anything else
    Unknown,
}

/// Raw image reference as returned by a generative backend
///
/// Not trusted: must pass through the normalizer before it is allowed
/// into slide history or a pending bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    /// Create a reference from a URL or data URL
    #[inline]
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw reference
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Classify the reference
    #[must_use]
    pub fn kind(&self) -> ImageRefKind {
        let lower = self.0.trim_start().to_ascii_lowercase();
        if lower.starts_with("data:") {
            ImageRefKind::Inline
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageRefKind::Remote
        } else {
            ImageRefKind::Unknown
        }
    }
}

impl From<&NormalizedImage> for ImageRef {
    fn from(image: &NormalizedImage) -> Self {
        Self(image.0.clone())
    }
}

/// Canonical inline image (`data:image/png;base64,...`)
///
/// Constructed by the normalizer only; every rendering in a slide's
/// history is one of these. Deserialization re-checks that the value is a
/// base64 PNG data URL.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedImage(String);

impl NormalizedImage {
    /// Prefix of every canonical data URL
    pub const PREFIX: &'static str = "data:image/png;base64,";

    const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

    pub(crate) fn from_data_url(data_url: String) -> Self {
        Self(data_url)
    }

    /// Borrow the data URL
    #[inline]
    #[must_use]
    pub fn as_data_url(&self) -> &str {
        &self.0
    }

    /// Base64 payload without the data URL prefix
    #[inline]
    #[must_use]
    pub fn base64_payload(&self) -> &str {
        self.0.strip_prefix(Self::PREFIX).unwrap_or_default()
    }
}

impl TryFrom<String> for NormalizedImage {
    type Error = NormalizationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let payload = value.strip_prefix(Self::PREFIX).ok_or_else(|| {
            NormalizationError::LoadFailure("not a base64 PNG data URL".to_string())
        })?;
        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| NormalizationError::LoadFailure(format!("bad base64 payload: {e}")))?;
        if !bytes.starts_with(&Self::PNG_SIGNATURE) {
            return Err(NormalizationError::LoadFailure(
                "payload is not a PNG".to_string(),
            ));
        }
        Ok(Self(value))
    }
}

impl From<NormalizedImage> for String {
    fn from(image: NormalizedImage) -> Self {
        image.0
    }
}

impl fmt::Debug for NormalizedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads are large; show a short fingerprint instead.
        let payload = self.base64_payload();
        let head: String = payload.chars().take(16).collect();
        write!(f, "NormalizedImage({}.., {} bytes)", head, payload.len())
    }
}

/// One deck page: a named, append-only sequence of renderings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SlideRecord")]
pub struct Slide {
    id: SlideId,
    name: String,
    original: NormalizedImage,
    history: Vec<NormalizedImage>,
    pending: Option<PendingPersonalization>,
}

impl Slide {
    /// Create a slide whose first rendering is `original`
    #[must_use]
    pub fn new(id: SlideId, name: impl Into<String>, original: NormalizedImage) -> Self {
        Self {
            id,
            name: name.into(),
            history: vec![original.clone()],
            original,
            pending: None,
        }
    }

    /// Attach a pending bundle at creation time
    #[inline]
    #[must_use]
    pub fn with_pending(mut self, pending: PendingPersonalization) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Slide id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &SlideId {
        &self.id
    }

    /// Display label
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First-ever rendering; never changes
    #[inline]
    #[must_use]
    pub fn original(&self) -> &NormalizedImage {
        &self.original
    }

    /// All renderings, oldest first
    #[inline]
    #[must_use]
    pub fn history(&self) -> &[NormalizedImage] {
        &self.history
    }

    /// Current rendering (last history entry)
    #[must_use]
    pub fn current(&self) -> &NormalizedImage {
        // history is never empty: created with one entry, undo keeps one
        self.history.last().unwrap_or(&self.original)
    }

    /// First history entry, used as the regeneration base
    #[must_use]
    pub fn first_rendering(&self) -> &NormalizedImage {
        self.history.first().unwrap_or(&self.original)
    }

    /// Unreviewed candidate set, if any
    #[inline]
    #[must_use]
    pub fn pending(&self) -> Option<&PendingPersonalization> {
        self.pending.as_ref()
    }

    /// Whether there is a non-empty candidate set awaiting review
    #[inline]
    #[must_use]
    pub fn has_pending_variants(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.variations.is_empty())
    }

    /// Summary sent to the plan generator
    #[must_use]
    pub fn summary(&self) -> SlideSummary {
        SlideSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub(crate) fn push_rendering(&mut self, image: NormalizedImage) {
        self.history.push(image);
    }

    pub(crate) fn pop_rendering(&mut self) -> Option<NormalizedImage> {
        if self.history.len() > 1 {
            self.history.pop()
        } else {
            None
        }
    }

    pub(crate) fn set_pending(&mut self, pending: Option<PendingPersonalization>) {
        self.pending = pending;
    }
}

/// Unchecked wire form of a [`Slide`]
#[derive(Deserialize)]
struct SlideRecord {
    id: SlideId,
    name: String,
    original: NormalizedImage,
    history: Vec<NormalizedImage>,
    pending: Option<PendingPersonalization>,
}

impl TryFrom<SlideRecord> for Slide {
    type Error = DeckError;

    fn try_from(record: SlideRecord) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| DeckError::InvalidSlide {
            slide: record.id.clone(),
            reason: reason.to_string(),
        };
        match record.history.first() {
            None => return Err(invalid("history is empty")),
            Some(first) if *first != record.original => {
                return Err(invalid("first history entry differs from the original"))
            }
            Some(_) => {}
        }
        if let Some(pending) = &record.pending {
            if pending.is_empty() || pending.variations.len() != pending.variation_prompts.len() {
                return Err(invalid("pending candidates and prompts are not parallel"));
            }
        }
        Ok(Self {
            id: record.id,
            name: record.name,
            original: record.original,
            history: record.history,
            pending: record.pending,
        })
    }
}

/// Slide data shared with the plan generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideSummary {
    /// Slide id
    pub id: SlideId,
    /// Display label
    pub name: String,
}

/// Where a pending bundle came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingOrigin {
    /// A task of a batch execution plan
    Plan,
    /// A direct single-slide edit request
    SingleSlide(EditRequest),
}

/// Reviewable candidate set attached to one slide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPersonalization {
    /// Instruction that produced the candidates
    pub task_prompt: String,
    /// Candidate renderings
    pub variations: Vec<NormalizedImage>,
    /// Exact prompt used per candidate, parallel to `variations`
    pub variation_prompts: Vec<String>,
    /// Producer of the bundle
    pub origin: PendingOrigin,
    /// Write stamp reserved by the producer
    pub stamp: u64,
}

impl PendingPersonalization {
    /// Build a bundle
    ///
    /// Returns `None` if `variations` is empty or the prompt list is not
    /// parallel to it.
    #[must_use]
    pub fn new(
        task_prompt: impl Into<String>,
        variations: Vec<NormalizedImage>,
        variation_prompts: Vec<String>,
        origin: PendingOrigin,
        stamp: u64,
    ) -> Option<Self> {
        if variations.is_empty() || variations.len() != variation_prompts.len() {
            return None;
        }
        Some(Self {
            task_prompt: task_prompt.into(),
            variations,
            variation_prompts,
            origin,
            stamp,
        })
    }

    /// Number of candidates
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.variations.len()
    }

    /// Always false for a bundle built with [`PendingPersonalization::new`]
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variations.is_empty()
    }
}

/// Closed set of single-slide edit kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EditWorkflow {
    /// Generic generative edit of the current rendering
    Generate,
    /// Full remake guided by a style reference image
    Remake {
        /// Reference image the remake follows
        style_reference: NormalizedImage,
    },
}

impl EditWorkflow {
    /// Style reference, present only for the remake workflow
    #[inline]
    #[must_use]
    pub fn style_reference(&self) -> Option<&NormalizedImage> {
        match self {
            Self::Generate => None,
            Self::Remake { style_reference } => Some(style_reference),
        }
    }
}

/// Parameters of a single-slide (non-plan) edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    /// Edit kind
    pub workflow: EditWorkflow,
    /// Natural-language instruction
    pub prompt: String,
    /// Generative configuration identifier
    pub model: String,
    /// Depth/cost toggle
    pub deep_mode: bool,
}

impl EditRequest {
    /// Generic generative edit
    #[must_use]
    pub fn generate(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            workflow: EditWorkflow::Generate,
            prompt: prompt.into(),
            model: model.into(),
            deep_mode: false,
        }
    }

    /// Remake with a style reference
    #[must_use]
    pub fn remake(
        prompt: impl Into<String>,
        model: impl Into<String>,
        style_reference: NormalizedImage,
    ) -> Self {
        Self {
            workflow: EditWorkflow::Remake { style_reference },
            prompt: prompt.into(),
            model: model.into(),
            deep_mode: false,
        }
    }

    /// With deep mode
    #[inline]
    #[must_use]
    pub fn with_deep_mode(mut self, deep_mode: bool) -> Self {
        self.deep_mode = deep_mode;
        self
    }
}

/// Most recent single-slide edit the human accepted
///
/// Session-owned and single use; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSuccessfulEditContext {
    /// Edit kind (carries the style reference for remakes)
    pub workflow: EditWorkflow,
    /// Instruction that produced the accepted result
    pub user_intent_prompt: String,
    /// Generative configuration used
    pub model: String,
    /// Depth/cost toggle used
    pub deep_mode: bool,
}

impl LastSuccessfulEditContext {
    /// Style reference, if the edit was a remake
    #[inline]
    #[must_use]
    pub fn style_reference(&self) -> Option<&NormalizedImage> {
        self.workflow.style_reference()
    }
}

impl From<EditRequest> for LastSuccessfulEditContext {
    fn from(request: EditRequest) -> Self {
        Self {
            workflow: request.workflow,
            user_intent_prompt: request.prompt,
            model: request.model,
            deep_mode: request.deep_mode,
        }
    }
}
