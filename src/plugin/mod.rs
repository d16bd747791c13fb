//! Plugin contract: the interface the engine consumes from step
//! implementations.
//!
//! A plugin advertises a manifest (name, version, the step types it
//! handles) and exposes a single `execute` operation. The engine knows
//! nothing else about what a step does.

mod registry;

pub use registry::PluginRegistry;

use crate::cancellation::CancellationToken;
use crate::core::{Event, LogEntry, LogLevel, OutputMap, Step};
use crate::errors::PluginError;
use crate::events::EventBus;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metadata a plugin advertises at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin name.
    pub name: String,
    /// Plugin version string.
    pub version: String,
    /// The step types this plugin handles.
    pub step_types: Vec<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Author attribution.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
}

impl PluginManifest {
    /// Creates a manifest with the given name and step types.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        step_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            step_types: step_types.into_iter().map(Into::into).collect(),
            description: String::new(),
            author: String::new(),
        }
    }
}

/// The capability a step implementation exposes to the engine.
///
/// Plugins must respect cancellation promptly: poll
/// [`StepContext::is_cancelled`] or await [`StepContext::cancelled`] at
/// natural suspension points.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Returns the plugin's manifest.
    fn manifest(&self) -> PluginManifest;

    /// Executes one step, returning its outputs.
    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<OutputMap, PluginError>;
}

/// Shared buffer collecting step-scoped log lines for a run.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }

    /// Drains all collected entries.
    #[must_use]
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Snapshot of collected entries.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}

/// The execution context handed to a plugin for one step attempt.
pub struct StepContext {
    pipeline_id: String,
    run_id: String,
    step_id: String,
    attempt: u32,
    cancel: Arc<CancellationToken>,
    deadline: Option<Instant>,
    environment: HashMap<String, String>,
    logs: LogSink,
    bus: Arc<EventBus>,
}

impl StepContext {
    /// Creates a context for one step attempt.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        pipeline_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt: u32,
        cancel: Arc<CancellationToken>,
        deadline: Option<Instant>,
        environment: HashMap<String, String>,
        logs: LogSink,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            attempt,
            cancel,
            deadline,
            environment,
            logs,
            bus,
        }
    }

    /// The pipeline being executed.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// The run this step belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The step being executed.
    #[must_use]
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The attempt number, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The absolute deadline for this attempt, when a timeout applies.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline; `None` when no timeout applies.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The resolved environment for this step.
    #[must_use]
    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Logs a step-scoped line onto the run.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs
            .push(LogEntry::new(Some(self.step_id.clone()), level, message));
    }

    /// Emits a `step.progress` event with a plugin-supplied payload.
    ///
    /// Delivery is best-effort; a full subscriber buffer drops the event.
    pub fn progress(&self, data: serde_json::Value) {
        self.bus.emit(Event::step_progress(
            &self.pipeline_id,
            &self.run_id,
            &self.step_id,
            data,
        ));
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("pipeline_id", &self.pipeline_id)
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> StepContext {
        StepContext::new(
            "p1",
            "r1",
            "s1",
            1,
            Arc::new(CancellationToken::new()),
            None,
            HashMap::new(),
            LogSink::new(),
            Arc::new(EventBus::new(8)),
        )
    }

    #[test]
    fn test_context_accessors() {
        let ctx = context();
        assert_eq!(ctx.pipeline_id(), "p1");
        assert_eq!(ctx.run_id(), "r1");
        assert_eq!(ctx.step_id(), "s1");
        assert_eq!(ctx.attempt(), 1);
        assert!(!ctx.is_cancelled());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_context_logging_is_step_scoped() {
        let logs = LogSink::new();
        let ctx = StepContext::new(
            "p1",
            "r1",
            "s1",
            1,
            Arc::new(CancellationToken::new()),
            None,
            HashMap::new(),
            logs.clone(),
            Arc::new(EventBus::new(8)),
        );

        ctx.log(LogLevel::Info, "compiling");
        let entries = logs.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].step_id.as_deref(), Some("s1"));
        assert_eq!(entries[0].message, "compiling");
    }

    #[test]
    fn test_deadline_remaining() {
        let ctx = StepContext::new(
            "p1",
            "r1",
            "s1",
            1,
            Arc::new(CancellationToken::new()),
            Some(Instant::now() + Duration::from_secs(10)),
            HashMap::new(),
            LogSink::new(),
            Arc::new(EventBus::new(8)),
        );
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(5));
    }
}
