//! Mock plugins with scripted behavior.

use crate::core::{OutputMap, Step};
use crate::errors::PluginError;
use crate::plugin::{Plugin, PluginManifest, StepContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A mock plugin with configurable delay, scripted failures, and call
/// tracking.
pub struct MockPlugin {
    manifest: PluginManifest,
    delay: Option<Duration>,
    outputs: OutputMap,
    /// Per-step count of attempts that should fail before succeeding.
    fail_first: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
    executed_steps: Mutex<Vec<String>>,
}

impl MockPlugin {
    /// Creates a mock plugin handling the given step types.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        step_types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            manifest: PluginManifest::new(name, "0.0.0-test", step_types),
            delay: None,
            outputs: OutputMap::new(),
            fail_first: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            executed_steps: Mutex::new(Vec::new()),
        }
    }

    /// Sleeps for `delay` on every execution (cooperatively cancellable
    /// from the scheduler side).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns these outputs on success.
    #[must_use]
    pub fn with_outputs(mut self, outputs: OutputMap) -> Self {
        self.outputs = outputs;
        self
    }

    /// Fails the first `n` executions of the given step, then succeeds.
    #[must_use]
    pub fn failing_first(self, step_id: impl Into<String>, n: u32) -> Self {
        self.fail_first.lock().insert(step_id.into(), n);
        self
    }

    /// Total number of `execute` calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The step ids executed, in call order.
    #[must_use]
    pub fn executed_steps(&self) -> Vec<String> {
        self.executed_steps.lock().clone()
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn manifest(&self) -> PluginManifest {
        self.manifest.clone()
    }

    async fn execute(&self, _ctx: &StepContext, step: &Step) -> Result<OutputMap, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed_steps.lock().push(step.id.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = {
            let mut fail_first = self.fail_first.lock();
            match fail_first.get_mut(&step.id) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if should_fail {
            Err(PluginError::new(format!(
                "scripted failure for step '{}'",
                step.id
            )))
        } else {
            Ok(self.outputs.clone())
        }
    }
}

impl std::fmt::Debug for MockPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlugin")
            .field("name", &self.manifest.name)
            .field("calls", &self.call_count())
            .finish()
    }
}

/// A plugin backed by a closure, for one-off test behaviors.
pub struct FnPlugin<F>
where
    F: Fn(&StepContext, &Step) -> Result<OutputMap, PluginError> + Send + Sync,
{
    manifest: PluginManifest,
    func: F,
}

impl<F> FnPlugin<F>
where
    F: Fn(&StepContext, &Step) -> Result<OutputMap, PluginError> + Send + Sync,
{
    /// Creates a closure-backed plugin.
    pub fn new(
        name: impl Into<String>,
        step_types: impl IntoIterator<Item = impl Into<String>>,
        func: F,
    ) -> Self {
        Self {
            manifest: PluginManifest::new(name, "0.0.0-test", step_types),
            func,
        }
    }
}

#[async_trait]
impl<F> Plugin for FnPlugin<F>
where
    F: Fn(&StepContext, &Step) -> Result<OutputMap, PluginError> + Send + Sync,
{
    fn manifest(&self) -> PluginManifest {
        self.manifest.clone()
    }

    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<OutputMap, PluginError> {
        (self.func)(ctx, step)
    }
}

impl<F> std::fmt::Debug for FnPlugin<F>
where
    F: Fn(&StepContext, &Step) -> Result<OutputMap, PluginError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPlugin")
            .field("name", &self.manifest.name)
            .finish()
    }
}
