//! Engine facade: the public API surface.
//!
//! An [`Engine`] owns the plugin registry, pipeline store, artifact
//! cache, event bus, and scheduler. Callers register plugins, create
//! pipelines, execute runs, and observe progress by polling run
//! snapshots or subscribing to the bus.

use crate::cache::ArtifactCache;
use crate::core::{
    Event, LogEntry, Pipeline, PipelineSpec, Run, RunParams, RETRY_OF,
};
use crate::errors::{EngineError, ValidationError};
use crate::events::{EventBus, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::graph::PipelineGraph;
use crate::plugin::{Plugin, PluginManifest, PluginRegistry};
use crate::scheduler::{RunContext, Scheduler};
use crate::store::PipelineStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Construction-time knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the step worker pool.
    pub worker_pool_size: usize,
    /// Default event buffer capacity per subscriber.
    pub default_subscriber_capacity: usize,
    /// Bound on completed cache entries (`None` = unbounded).
    pub cache_capacity: Option<usize>,
    /// Timeout applied to steps that declare none.
    pub default_step_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            worker_pool_size: parallelism.max(4),
            default_subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            cache_capacity: None,
            default_step_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    /// Sets the default subscriber capacity.
    #[must_use]
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.default_subscriber_capacity = capacity.max(1);
        self
    }

    /// Bounds the artifact cache.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity.max(1));
        self
    }

    /// Sets a timeout for steps that declare none.
    #[must_use]
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }
}

/// The pipeline execution engine.
pub struct Engine {
    registry: Arc<PluginRegistry>,
    cache: Arc<ArtifactCache>,
    bus: Arc<EventBus>,
    store: Arc<PipelineStore>,
    scheduler: Arc<Scheduler>,
    graphs: RwLock<HashMap<String, Arc<PipelineGraph>>>,
}

impl Engine {
    /// Creates an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(PluginRegistry::new());
        let cache = ArtifactCache::new(config.cache_capacity);
        let bus = Arc::new(EventBus::new(config.default_subscriber_capacity));
        let scheduler = Scheduler::new(
            registry.clone(),
            cache.clone(),
            bus.clone(),
            config.worker_pool_size,
            config.default_step_timeout,
        );

        Self {
            registry,
            cache,
            bus,
            store: Arc::new(PipelineStore::new()),
            scheduler,
            graphs: RwLock::new(HashMap::new()),
        }
    }

    /// The artifact cache, for administrative invalidation.
    #[must_use]
    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Registers a plugin.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the plugin name or a step type is
    /// already claimed.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        self.registry.register(plugin)
    }

    /// Manifests of all registered plugins.
    #[must_use]
    pub fn list_plugins(&self) -> Vec<PluginManifest> {
        self.registry.manifests()
    }

    /// Validates and stores a pipeline definition; emits
    /// `pipeline.created`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` on structural violations or unknown step
    /// types and `Duplicate` on id collision.
    pub fn create_pipeline(&self, spec: PipelineSpec) -> Result<Pipeline, EngineError> {
        let pipeline = spec.normalize();
        let graph = Arc::new(PipelineGraph::build(&pipeline)?);
        self.check_step_types(&pipeline)?;

        let stored = self.store.insert_pipeline(pipeline)?;
        self.graphs.write().insert(stored.id.clone(), graph);
        self.bus.emit(Event::pipeline_created(&stored.id));
        debug!(pipeline = %stored.id, "pipeline created");
        Ok((*stored).clone())
    }

    /// Replaces a pipeline definition, preserving its creation time;
    /// emits `pipeline.deleted` then `pipeline.created`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `InUse` while runs are
    /// active, and `InvalidSpec` on validation failure.
    pub fn update_pipeline(&self, spec: PipelineSpec) -> Result<Pipeline, EngineError> {
        let pipeline = spec.normalize();
        let graph = Arc::new(PipelineGraph::build(&pipeline)?);
        self.check_step_types(&pipeline)?;

        let stored = self.store.replace_pipeline(pipeline)?;
        self.graphs.write().insert(stored.id.clone(), graph);
        self.bus.emit(Event::pipeline_deleted(&stored.id));
        self.bus.emit(Event::pipeline_created(&stored.id));
        Ok((*stored).clone())
    }

    /// Returns a snapshot of a pipeline.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub fn get_pipeline(&self, id: &str) -> Result<Pipeline, EngineError> {
        Ok((*self.store.pipeline(id)?).clone())
    }

    /// Snapshot list of all pipelines (order unspecified).
    #[must_use]
    pub fn list_pipelines(&self) -> Vec<Pipeline> {
        self.store
            .pipelines()
            .into_iter()
            .map(|p| (*p).clone())
            .collect()
    }

    /// Deletes a pipeline; emits `pipeline.deleted`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `InUse` while any of its
    /// runs is non-terminal.
    pub fn delete_pipeline(&self, id: &str) -> Result<(), EngineError> {
        self.store.delete_pipeline(id)?;
        self.graphs.write().remove(id);
        self.bus.emit(Event::pipeline_deleted(id));
        debug!(pipeline = %id, "pipeline deleted");
        Ok(())
    }

    /// Starts a run with default params; the run proceeds concurrently.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pipelines.
    pub fn execute_run(&self, pipeline_id: &str) -> Result<String, EngineError> {
        self.execute_run_with(pipeline_id, RunParams::default())
    }

    /// Starts a run with explicit params, returning the new run id.
    ///
    /// The caller observes the outcome by polling [`Engine::get_run`] or
    /// subscribing; run-time failures never surface here.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pipelines.
    pub fn execute_run_with(
        &self,
        pipeline_id: &str,
        params: RunParams,
    ) -> Result<String, EngineError> {
        let pipeline = self.store.pipeline(pipeline_id)?;
        let graph = self.graph_for(&pipeline)?;

        let run_ctx = RunContext {
            branch: params.branch.clone(),
            prior_status: self
                .store
                .latest_terminal_run(pipeline_id)
                .map(|run| run.status),
        };

        let run = Run::new(&pipeline, params);
        let run_id = run.id.clone();
        let handle = self.store.insert_run(run);

        debug!(pipeline = %pipeline_id, run = %run_id, "run starting");
        tokio::spawn(
            self.scheduler
                .clone()
                .run(pipeline, graph, handle, run_ctx),
        );
        Ok(run_id)
    }

    /// Returns a snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `Mismatch` when the run
    /// belongs to a different pipeline.
    pub fn get_run(&self, pipeline_id: &str, run_id: &str) -> Result<Run, EngineError> {
        self.store.pipeline(pipeline_id)?;
        let run = self.store.run(run_id)?.snapshot();
        if run.pipeline_id != pipeline_id {
            return Err(EngineError::Mismatch {
                pipeline_id: pipeline_id.to_string(),
                run_id: run_id.to_string(),
            });
        }
        Ok(run)
    }

    /// Snapshot of all runs of a pipeline.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown pipelines.
    pub fn list_runs(&self, pipeline_id: &str) -> Result<Vec<Run>, EngineError> {
        self.store.pipeline(pipeline_id)?;
        Ok(self.store.runs_for(pipeline_id))
    }

    /// Snapshot of a run's log entries.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown runs.
    pub fn run_logs(&self, run_id: &str) -> Result<Vec<LogEntry>, EngineError> {
        Ok(self.store.run(run_id)?.snapshot().logs)
    }

    /// Re-executes a pipeline from scratch, linking the new run to the
    /// original through `metadata.retryOf`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `Mismatch` when the run
    /// belongs to a different pipeline.
    pub fn retry_run(&self, pipeline_id: &str, run_id: &str) -> Result<String, EngineError> {
        let original = self.get_run(pipeline_id, run_id)?;

        let mut params = original.params.clone();
        params
            .metadata
            .insert(RETRY_OF.to_string(), serde_json::json!(run_id));
        self.execute_run_with(pipeline_id, params)
    }

    /// Requests cancellation of a run. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown runs.
    pub fn cancel_run(&self, run_id: &str) -> Result<(), EngineError> {
        let handle = self.store.run(run_id)?;
        handle.cancel_token().cancel("cancelled by user");
        debug!(run = %run_id, "cancellation requested");
        Ok(())
    }

    /// Registers an event subscriber; it receives events emitted
    /// strictly after this call.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the id is already subscribed.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        capacity: Option<usize>,
    ) -> Result<Subscription, EngineError> {
        self.bus.subscribe(id, capacity)
    }

    /// Deregisters a subscriber; its sink drains and closes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is not subscribed.
    pub fn unsubscribe(&self, id: &str) -> Result<(), EngineError> {
        self.bus.unsubscribe(id)
    }

    /// How many events were dropped for a subscriber.
    #[must_use]
    pub fn dropped_events(&self, id: &str) -> Option<u64> {
        self.bus.dropped(id)
    }

    fn graph_for(&self, pipeline: &Arc<Pipeline>) -> Result<Arc<PipelineGraph>, EngineError> {
        if let Some(graph) = self.graphs.read().get(&pipeline.id) {
            return Ok(graph.clone());
        }
        // Stored pipelines were validated at creation; rebuilding only
        // happens if the graph cache was dropped out from under us.
        let graph = Arc::new(PipelineGraph::build(pipeline)?);
        self.graphs
            .write()
            .insert(pipeline.id.clone(), graph.clone());
        Ok(graph)
    }

    /// Every step type (or explicit plugin name) must resolve.
    fn check_step_types(&self, pipeline: &Pipeline) -> Result<(), EngineError> {
        for stage in &pipeline.stages {
            for step in &stage.steps {
                let known = match &step.plugin {
                    Some(name) => self.registry.get(name).is_some(),
                    None => self.registry.handles(&step.step_type),
                };
                if !known {
                    return Err(ValidationError::UnknownStepType {
                        step: step.id.clone(),
                        step_type: step
                            .plugin
                            .clone()
                            .unwrap_or_else(|| step.step_type.clone()),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pipelines", &self.store.pipelines().len())
            .field("plugins", &self.registry.len())
            .field("subscribers", &self.bus.subscriber_count())
            .finish()
    }
}
