//! Run records: one execution instance of a pipeline.

use super::{Pipeline, RunStatus, StepStatus};
use crate::errors::StepErrorInfo;
use crate::utils::{new_run_id, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The outputs a plugin produced for one step.
pub type OutputMap = HashMap<String, serde_json::Value>;

/// Metadata key linking a retried run to its original.
pub const RETRY_OF: &str = "retryOf";

/// Caller-supplied parameters for a single run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    /// The branch under build; consulted by `when.branch` predicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Extra environment overlaid between pipeline and step scopes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Free-form metadata copied onto the run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RunParams {
    /// Creates params for the given branch.
    #[must_use]
    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Self::default()
        }
    }
}

/// A single execution instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Engine-generated run id.
    pub id: String,
    /// The pipeline this run executes.
    pub pipeline_id: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// When the run record was created.
    pub created_at: Timestamp,
    /// When execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Per-step state, keyed by step id.
    pub steps: HashMap<String, StepState>,
    /// Log entries appended by plugin contexts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    /// The params this run was started with.
    #[serde(default)]
    pub params: RunParams,
    /// Free-form metadata; `retryOf` links a retried run to its original.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Run {
    /// Creates a pending run for the given pipeline with one pending
    /// [`StepState`] per step.
    #[must_use]
    pub fn new(pipeline: &Pipeline, params: RunParams) -> Self {
        let steps = pipeline
            .stages
            .iter()
            .flat_map(|stage| stage.steps.iter())
            .map(|step| (step.id.clone(), StepState::pending(&step.id, &step.name)))
            .collect();

        let metadata = params.metadata.clone();

        Self {
            id: new_run_id(),
            pipeline_id: pipeline.id.clone(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            steps,
            logs: Vec::new(),
            params,
            metadata,
        }
    }

    /// Looks up a step record.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.get(id)
    }

    /// Whether the run has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The run id this run retries, if any.
    #[must_use]
    pub fn retry_of(&self) -> Option<&str> {
        self.metadata.get(RETRY_OF).and_then(|v| v.as_str())
    }
}

/// Per-run execution state of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    /// The step id.
    pub id: String,
    /// The step's display name.
    pub name: String,
    /// Lifecycle status.
    pub status: StepStatus,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    /// Number of attempts made; 0 for cache hits and skipped steps.
    pub attempts: u32,
    /// Exit code reported by the plugin, when present in the outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Outputs captured from the plugin or the cache.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: OutputMap,
    /// Whether the outputs came from the artifact cache.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
    /// The captured failure, for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepErrorInfo>,
    /// Why the step was skipped, for skipped steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepState {
    /// Creates a pending step record.
    #[must_use]
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            attempts: 0,
            exit_code: None,
            outputs: OutputMap::new(),
            cached: false,
            error: None,
            skip_reason: None,
        }
    }
}

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress output.
    Info,
    /// Something suspicious but not fatal.
    Warn,
    /// A failure.
    Error,
}

/// One line of step-scoped log output captured on the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// When the line was logged.
    pub timestamp: Timestamp,
    /// The step that produced it, when step-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Severity.
    pub level: LogLevel,
    /// The message.
    pub message: String,
}

impl LogEntry {
    /// Creates a log entry stamped with the current time.
    #[must_use]
    pub fn new(step_id: Option<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            step_id,
            level,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineSpec, Stage, Step};

    fn pipeline() -> Pipeline {
        PipelineSpec::new("p1", "test")
            .with_stage(
                Stage::new("build")
                    .with_step(Step::new("a", "shell"))
                    .with_step(Step::new("b", "shell").depends_on(["a"])),
            )
            .normalize()
    }

    #[test]
    fn test_new_run_is_pending_with_pending_steps() {
        let run = Run::new(&pipeline(), RunParams::default());
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.steps.len(), 2);
        assert!(run
            .steps
            .values()
            .all(|s| s.status == StepStatus::Pending && s.attempts == 0));
        assert!(run.started_at.is_none());
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn test_retry_of_reads_metadata() {
        let mut params = RunParams::default();
        params
            .metadata
            .insert(RETRY_OF.to_string(), serde_json::json!("run-original"));
        let run = Run::new(&pipeline(), params);
        assert_eq!(run.retry_of(), Some("run-original"));
    }

    #[test]
    fn test_run_serializes_camel_case() {
        let run = Run::new(&pipeline(), RunParams::branch("main"));
        let json = serde_json::to_value(&run).unwrap();
        assert!(json.get("pipelineId").is_some());
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["params"]["branch"], "main");
    }
}
