//! Plan validation
//!
//! Gatekeeper between an externally generated execution plan and any
//! mutation. The planner output is untyped JSON; it is parsed into tagged
//! variants and rejected on the first field of the wrong shape.
//!
//! [`ValidatedPlan`] has no public constructor, so every plan that reaches
//! the coordinator has passed [`validate_plan`].

use crate::error::PlanError;
use crate::types::SlideId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag of an edit task
pub const EDIT_SLIDE: &str = "EDIT_SLIDE";
/// Tag of an add task
pub const ADD_SLIDE: &str = "ADD_SLIDE";

/// One step of an execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlanTask {
    /// Change an existing slide
    #[serde(rename = "EDIT_SLIDE")]
    EditSlide {
        /// Slide to edit
        #[serde(rename = "slideId")]
        slide_id: SlideId,
        /// Change description
        detailed_prompt: String,
    },
    /// Create a new slide
    #[serde(rename = "ADD_SLIDE")]
    AddSlide {
        /// Slide the new one goes after
        #[serde(rename = "insertAfterSlideId")]
        insert_after: SlideId,
        /// Label for the new slide
        #[serde(rename = "newSlideName", default, skip_serializing_if = "Option::is_none")]
        new_slide_name: Option<String>,
        /// Content description
        detailed_prompt: String,
    },
}

impl PlanTask {
    /// Slide id the task is keyed by (`slideId` or `insertAfterSlideId`)
    #[must_use]
    pub fn target(&self) -> &SlideId {
        match self {
            Self::EditSlide { slide_id, .. } => slide_id,
            Self::AddSlide { insert_after, .. } => insert_after,
        }
    }

    /// Task prompt
    #[must_use]
    pub fn prompt(&self) -> &str {
        match self {
            Self::EditSlide { detailed_prompt, .. } | Self::AddSlide { detailed_prompt, .. } => {
                detailed_prompt
            }
        }
    }

    /// Tag as it appears on the wire
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::EditSlide { .. } => EDIT_SLIDE,
            Self::AddSlide { .. } => ADD_SLIDE,
        }
    }
}

/// A plan that passed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedPlan {
    tasks: Vec<PlanTask>,
}

impl ValidatedPlan {
    /// Tasks in planner order
    #[inline]
    #[must_use]
    pub fn tasks(&self) -> &[PlanTask] {
        &self.tasks
    }

    /// Number of tasks (never zero)
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Always false
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Consume into tasks
    #[inline]
    #[must_use]
    pub fn into_tasks(self) -> Vec<PlanTask> {
        self.tasks
    }
}

/// Validate planner output
///
/// # Errors
/// - `PlanError::StructurallyInvalid` if the value is not an object with a
///   `tasks` array, or any task has an unknown tag, a field of the wrong
///   type, a missing prompt, or an empty target id
/// - `PlanError::NoActionableTasks` if `tasks` is empty
pub fn validate_plan(raw: &Value) -> Result<ValidatedPlan, PlanError> {
    let object = raw
        .as_object()
        .ok_or_else(|| PlanError::invalid("plan is not an object"))?;

    let tasks = object
        .get("tasks")
        .ok_or_else(|| PlanError::invalid("plan has no `tasks` field"))?
        .as_array()
        .ok_or_else(|| PlanError::invalid("`tasks` is not a list"))?;

    if tasks.is_empty() {
        return Err(PlanError::NoActionableTasks);
    }

    let tasks = tasks
        .iter()
        .enumerate()
        .map(|(index, task)| parse_task(index, task))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ValidatedPlan { tasks })
}

/// Parse JSON text and validate it
///
/// # Errors
/// Returns `PlanError::StructurallyInvalid` for text that is not JSON,
/// otherwise as [`validate_plan`].
pub fn parse_plan(text: &str) -> Result<ValidatedPlan, PlanError> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|e| PlanError::invalid(format!("plan is not valid JSON: {e}")))?;
    validate_plan(&raw)
}

fn parse_task(index: usize, raw: &Value) -> Result<PlanTask, PlanError> {
    if !raw.is_object() {
        return Err(PlanError::invalid_task(index, "task is not an object"));
    }

    let tag = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PlanError::invalid_task(index, "task has no string `type`"))?;

    if tag != EDIT_SLIDE && tag != ADD_SLIDE {
        return Err(PlanError::invalid_task(
            index,
            format!("unknown task type '{tag}'"),
        ));
    }

    let task = PlanTask::deserialize(raw)
        .map_err(|e| PlanError::invalid_task(index, format!("{tag}: {e}")))?;

    if task.target().as_str().trim().is_empty() {
        let field = match task {
            PlanTask::EditSlide { .. } => "slideId",
            PlanTask::AddSlide { .. } => "insertAfterSlideId",
        };
        return Err(PlanError::invalid_task(index, format!("`{field}` is empty")));
    }

    Ok(task)
}
