//! Lifecycle events emitted by the engine.

use super::{RunStatus, StepStatus};
use crate::errors::StepErrorInfo;
use crate::utils::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An immutable lifecycle event.
///
/// Every run and step state transition emits exactly one event. Event
/// `data` carries transition detail (status, attempt, cached flag, error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// The event type (e.g. "step.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was emitted.
    pub timestamp: Timestamp,
    /// The pipeline the event belongs to.
    pub pipeline_id: String,
    /// The run, when run-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// The step, when step-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Opaque event payload.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Creates a pipeline-scoped event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            pipeline_id: pipeline_id.into(),
            run_id: None,
            step_id: None,
            data: HashMap::new(),
        }
    }

    /// Scopes the event to a run.
    #[must_use]
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Scopes the event to a step.
    #[must_use]
    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Adds a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Creates a "pipeline.created" event.
    #[must_use]
    pub fn pipeline_created(pipeline_id: &str) -> Self {
        Self::new("pipeline.created", pipeline_id)
    }

    /// Creates a "pipeline.deleted" event.
    #[must_use]
    pub fn pipeline_deleted(pipeline_id: &str) -> Self {
        Self::new("pipeline.deleted", pipeline_id)
    }

    /// Creates a "run.started" event.
    #[must_use]
    pub fn run_started(pipeline_id: &str, run_id: &str) -> Self {
        Self::new("run.started", pipeline_id).for_run(run_id)
    }

    /// Creates a "run.completed" event carrying the terminal status.
    #[must_use]
    pub fn run_completed(pipeline_id: &str, run_id: &str, status: RunStatus) -> Self {
        Self::new("run.completed", pipeline_id)
            .for_run(run_id)
            .with_data("status", serde_json::json!(status))
    }

    /// Creates a "run.cancelled" event.
    #[must_use]
    pub fn run_cancelled(pipeline_id: &str, run_id: &str) -> Self {
        Self::new("run.cancelled", pipeline_id)
            .for_run(run_id)
            .with_data("status", serde_json::json!(RunStatus::Cancelled))
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(pipeline_id: &str, run_id: &str, stage_id: &str) -> Self {
        Self::new("stage.started", pipeline_id)
            .for_run(run_id)
            .with_data("stage", serde_json::json!(stage_id))
    }

    /// Creates a "stage.completed" event carrying the stage outcome.
    #[must_use]
    pub fn stage_completed(pipeline_id: &str, run_id: &str, stage_id: &str, status: &str) -> Self {
        Self::new("stage.completed", pipeline_id)
            .for_run(run_id)
            .with_data("stage", serde_json::json!(stage_id))
            .with_data("status", serde_json::json!(status))
    }

    /// Creates a "step.started" event.
    #[must_use]
    pub fn step_started(pipeline_id: &str, run_id: &str, step_id: &str) -> Self {
        Self::new("step.started", pipeline_id)
            .for_run(run_id)
            .for_step(step_id)
            .with_data("attempt", serde_json::json!(1))
    }

    /// Creates a "step.retried" event carrying the new attempt number and
    /// the error that triggered the retry.
    #[must_use]
    pub fn step_retried(
        pipeline_id: &str,
        run_id: &str,
        step_id: &str,
        attempt: u32,
        error: &StepErrorInfo,
    ) -> Self {
        Self::new("step.retried", pipeline_id)
            .for_run(run_id)
            .for_step(step_id)
            .with_data("attempt", serde_json::json!(attempt))
            .with_data("error", serde_json::json!(error))
    }

    /// Creates a "step.completed" event for a terminal success or failure.
    #[must_use]
    pub fn step_completed(
        pipeline_id: &str,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        attempts: u32,
        cached: bool,
    ) -> Self {
        Self::new("step.completed", pipeline_id)
            .for_run(run_id)
            .for_step(step_id)
            .with_data("status", serde_json::json!(status))
            .with_data("attempts", serde_json::json!(attempts))
            .with_data("cached", serde_json::json!(cached))
    }

    /// Creates a "step.skipped" event with the skip reason.
    #[must_use]
    pub fn step_skipped(pipeline_id: &str, run_id: &str, step_id: &str, reason: &str) -> Self {
        Self::new("step.skipped", pipeline_id)
            .for_run(run_id)
            .for_step(step_id)
            .with_data("reason", serde_json::json!(reason))
    }

    /// Creates a "step.cancelled" event.
    #[must_use]
    pub fn step_cancelled(pipeline_id: &str, run_id: &str, step_id: &str) -> Self {
        Self::new("step.cancelled", pipeline_id)
            .for_run(run_id)
            .for_step(step_id)
    }

    /// Creates a "step.progress" event with a plugin-supplied payload.
    #[must_use]
    pub fn step_progress(
        pipeline_id: &str,
        run_id: &str,
        step_id: &str,
        data: serde_json::Value,
    ) -> Self {
        Self::new("step.progress", pipeline_id)
            .for_run(run_id)
            .for_step(step_id)
            .with_data("progress", data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StepErrorKind;

    #[test]
    fn test_step_completed_payload() {
        let event = Event::step_completed("p1", "r1", "s1", StepStatus::Success, 2, false);
        assert_eq!(event.event_type, "step.completed");
        assert_eq!(event.step_id.as_deref(), Some("s1"));
        assert_eq!(event.data["status"], serde_json::json!("success"));
        assert_eq!(event.data["attempts"], serde_json::json!(2));
    }

    #[test]
    fn test_retried_carries_attempt_and_error() {
        let err = StepErrorInfo::new(StepErrorKind::Plugin, "boom");
        let event = Event::step_retried("p1", "r1", "s1", 2, &err);
        assert_eq!(event.data["attempt"], serde_json::json!(2));
        assert_eq!(event.data["error"]["kind"], serde_json::json!("plugin"));
    }

    #[test]
    fn test_serialization_uses_type_field() {
        let event = Event::run_started("p1", "r1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run.started");
        assert_eq!(json["pipelineId"], "p1");
        assert_eq!(json["runId"], "r1");
    }
}
