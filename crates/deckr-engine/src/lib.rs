//! Deckr Engine - deck edit execution
//!
//! Takes a multi-step edit plan produced from a natural-language request and:
//! - Validates it before any side effect
//! - Executes its tasks concurrently against a generative backend
//! - Holds per-slide candidates for human review
//! - Replays an accepted single-slide edit across the rest of the deck
//!
//! # Example
//!
//! ```rust,ignore
//! use deckr_engine::prelude::*;
//!
//! # async fn example(
//! #     slides: Vec<Slide>,
//! #     planner: std::sync::Arc<dyn PlanGenerator>,
//! #     backend: std::sync::Arc<dyn GenerativeBackend>,
//! # ) -> Result<(), EngineError> {
//! let session = EditSession::new(&EngineConfig::new(), slides, planner, backend)?;
//!
//! let report = session.submit_request("make every title bold", false).await?;
//! for failure in report.failures() {
//!     println!("{}", failure.user_message());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod deck;
pub mod error;
pub mod normalizer;
pub mod plan;
pub mod propagation;
pub mod review;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use backend::{BoundedBackend, CreationExtras, GenerativeBackend, Generation, PlanGenerator};
pub use config::EngineConfig;
pub use coordinator::{ExecutionReport, TaskCoordinator, UnitSuccess};
pub use deck::{Deck, DeckHandle, PendingWrite};
pub use error::{
    BackendError, ConfigError, DeckError, EngineError, ErrorKind, NormalizationError, PlanError,
    ReviewError, UnitFailure,
};
pub use normalizer::{HttpImageFetcher, ImageFetcher, ImageNormalizer};
pub use plan::{parse_plan, validate_plan, PlanTask, ValidatedPlan};
pub use propagation::{EditPropagator, PropagationReport};
pub use review::{OpenOutcome, ReviewController, ReviewState};
pub use session::EditSession;
pub use types::{
    EditRequest, EditWorkflow, ImageRef, ImageRefKind, LastSuccessfulEditContext,
    NormalizedImage, PendingOrigin, PendingPersonalization, Slide, SlideId, SlideSummary,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving an editing session
    pub use crate::{
        EditRequest, EditSession, EngineConfig, EngineError, ExecutionReport, GenerativeBackend,
        LastSuccessfulEditContext, PlanGenerator, Slide, SlideId, UnitFailure,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
