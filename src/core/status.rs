//! Run and step status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but not yet started.
    Pending,
    /// Run is executing.
    Running,
    /// Every stage finished successfully.
    Success,
    /// At least one stage failed.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    /// Returns true if the status is terminal; terminal runs never
    /// transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The lifecycle status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step not yet dispatched.
    Pending,
    /// Step is executing (stays `Running` across retries).
    Running,
    /// Step finished successfully (including cache hits).
    Success,
    /// Step exhausted its attempts.
    Failed,
    /// Step never ran: `when` predicate false or upstream failure.
    Skipped,
    /// The run was cancelled before or while the step executed.
    Cancelled,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StepStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether this outcome satisfies downstream `dependsOn` edges.
    ///
    /// A step skipped by its `when` predicate counts as satisfied; a step
    /// skipped because an upstream failed does not reach this check (its
    /// dependents are skipped transitively).
    #[must_use]
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
