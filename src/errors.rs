//! Error types for the conveyor engine.
//!
//! Facade operations return [`EngineError`]. Failures inside a running
//! pipeline never surface as errors to the caller that started the run;
//! they are captured on the step and run records as [`StepErrorInfo`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A pipeline definition failed validation.
    #[error("{0}")]
    InvalidSpec(#[from] ValidationError),

    /// The named entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("pipeline", "run", "subscriber", ...).
        kind: &'static str,
        /// The id that missed.
        id: String,
    },

    /// An entity with the same id already exists.
    #[error("{kind} already registered: {id}")]
    Duplicate {
        /// What collided.
        kind: &'static str,
        /// The conflicting id.
        id: String,
    },

    /// A run id was paired with the wrong pipeline id.
    #[error("run '{run_id}' does not belong to pipeline '{pipeline_id}'")]
    Mismatch {
        /// The pipeline the caller named.
        pipeline_id: String,
        /// The run the caller named.
        run_id: String,
    },

    /// The pipeline still has non-terminal runs.
    #[error("pipeline '{id}' has {active} active run(s)")]
    InUse {
        /// The pipeline id.
        id: String,
        /// How many runs are non-terminal.
        active: usize,
    },
}

impl EngineError {
    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a `Duplicate` error.
    #[must_use]
    pub fn duplicate(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Duplicate {
            kind,
            id: id.into(),
        }
    }
}

/// Error raised when a pipeline definition violates a structural invariant.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// The pipeline has no stages or steps.
    #[error("pipeline '{pipeline}' defines no steps")]
    Empty {
        /// The pipeline id.
        pipeline: String,
    },

    /// Two stages or steps share an id.
    #[error("duplicate {scope} id '{id}'")]
    DuplicateId {
        /// "stage" or "step".
        scope: &'static str,
        /// The repeated id.
        id: String,
    },

    /// A `needs` or `dependsOn` entry names an id that does not exist.
    #[error("{scope} '{from}' references unknown id '{to}'")]
    UnknownReference {
        /// "stage" or "step".
        scope: &'static str,
        /// The referencing id.
        from: String,
        /// The dangling id.
        to: String,
    },

    /// A step's `dependsOn` names a step in a different stage.
    #[error("step '{step}' depends on '{dependency}' which belongs to stage '{other_stage}'; cross-stage ordering must use stage needs")]
    CrossStageDependency {
        /// The depending step.
        step: String,
        /// The step it named.
        dependency: String,
        /// The stage that owns the named step.
        other_stage: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cycle detected among {scope}s: {}", members.join(" -> "))]
    Cycle {
        /// "stage" or "step".
        scope: &'static str,
        /// The ids participating in the cycle, in discovery order.
        members: Vec<String>,
    },

    /// A step names a type with no registered plugin.
    #[error("step '{step}' has unknown step type '{step_type}'")]
    UnknownStepType {
        /// The offending step.
        step: String,
        /// The unresolvable type.
        step_type: String,
    },
}

/// Error returned by a plugin's `execute`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginError {
    /// Human-readable failure description.
    pub message: String,
}

impl PluginError {
    /// Creates a new plugin error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Classification of a step failure, recorded on the step and in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// No plugin is registered for the step's type.
    UnknownStepType,
    /// The step exceeded its deadline.
    Timeout,
    /// The run was cancelled while the step was pending or in flight.
    Cancelled,
    /// The plugin returned an error.
    Plugin,
    /// An upstream step or stage failed; this step never ran.
    UpstreamFailed,
}

impl StepErrorKind {
    /// Whether a failure of this kind is subject to the retry policy.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Plugin)
    }
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnknownStepType => "unknown_step_type",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Plugin => "plugin",
            Self::UpstreamFailed => "upstream_failed",
        };
        write!(f, "{s}")
    }
}

/// A captured step failure: kind plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorInfo {
    /// The failure classification.
    pub kind: StepErrorKind,
    /// The failure description.
    pub message: String,
}

impl StepErrorInfo {
    /// Creates a new step error record.
    #[must_use]
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error for the given duration.
    #[must_use]
    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            StepErrorKind::Timeout,
            format!("step exceeded timeout of {}ms", limit.as_millis()),
        )
    }
}

impl std::fmt::Display for StepErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
