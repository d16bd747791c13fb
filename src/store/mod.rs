//! In-memory registry of pipeline definitions and runs.
//!
//! Reads take the shared lock and return snapshots; writes take the
//! exclusive lock. Run records are mutated only by the supervisor task
//! driving the run, through its [`RunHandle`].

use crate::cancellation::CancellationToken;
use crate::core::{Pipeline, Run, RunStatus};
use crate::errors::EngineError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A live run record paired with its cancellation token.
#[derive(Debug)]
pub struct RunHandle {
    state: RwLock<Run>,
    cancel: Arc<CancellationToken>,
}

impl RunHandle {
    /// Wraps a freshly created run.
    #[must_use]
    pub fn new(run: Run) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(run),
            cancel: Arc::new(CancellationToken::new()),
        })
    }

    /// Returns a point-in-time copy of the run.
    #[must_use]
    pub fn snapshot(&self) -> Run {
        self.state.read().clone()
    }

    /// Applies a mutation under the exclusive lock.
    ///
    /// Only the run's supervisor task may call this.
    pub fn update<R>(&self, f: impl FnOnce(&mut Run) -> R) -> R {
        f(&mut self.state.write())
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// The run's current status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.state.read().status
    }
}

/// Process-local maps of pipelines and runs.
#[derive(Debug, Default)]
pub struct PipelineStore {
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl PipelineStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new pipeline.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` when the id already exists.
    pub fn insert_pipeline(&self, pipeline: Pipeline) -> Result<Arc<Pipeline>, EngineError> {
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&pipeline.id) {
            return Err(EngineError::duplicate("pipeline", &pipeline.id));
        }
        let arc = Arc::new(pipeline);
        pipelines.insert(arc.id.clone(), arc.clone());
        Ok(arc)
    }

    /// Looks up a pipeline.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is unknown.
    pub fn pipeline(&self, id: &str) -> Result<Arc<Pipeline>, EngineError> {
        self.pipelines
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("pipeline", id))
    }

    /// Snapshot list of all pipelines (order unspecified).
    #[must_use]
    pub fn pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.pipelines.read().values().cloned().collect()
    }

    /// Removes a pipeline.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `InUse` while any of the
    /// pipeline's runs is non-terminal.
    pub fn delete_pipeline(&self, id: &str) -> Result<Arc<Pipeline>, EngineError> {
        let mut pipelines = self.pipelines.write();
        let Some(pipeline) = pipelines.get(id).cloned() else {
            return Err(EngineError::not_found("pipeline", id));
        };

        let active = self
            .runs
            .read()
            .values()
            .filter(|handle| {
                let run = handle.state.read();
                run.pipeline_id == id && !run.status.is_terminal()
            })
            .count();
        if active > 0 {
            return Err(EngineError::InUse {
                id: id.to_string(),
                active,
            });
        }

        pipelines.remove(id);
        Ok(pipeline)
    }

    /// Replaces a pipeline definition, preserving its creation time.
    ///
    /// Modelled as delete + create under one exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `InUse` while runs are
    /// active.
    pub fn replace_pipeline(&self, mut pipeline: Pipeline) -> Result<Arc<Pipeline>, EngineError> {
        let previous = self.delete_pipeline(&pipeline.id)?;
        pipeline.created_at = previous.created_at;
        let arc = Arc::new(pipeline);
        self.pipelines
            .write()
            .insert(arc.id.clone(), arc.clone());
        Ok(arc)
    }

    /// Registers a freshly created run.
    #[must_use]
    pub fn insert_run(&self, run: Run) -> Arc<RunHandle> {
        let handle = RunHandle::new(run);
        self.runs
            .write()
            .insert(handle.state.read().id.clone(), handle.clone());
        handle
    }

    /// Looks up a run handle.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is unknown.
    pub fn run(&self, id: &str) -> Result<Arc<RunHandle>, EngineError> {
        self.runs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("run", id))
    }

    /// Snapshot of all runs belonging to a pipeline.
    #[must_use]
    pub fn runs_for(&self, pipeline_id: &str) -> Vec<Run> {
        self.runs
            .read()
            .values()
            .filter_map(|handle| {
                let run = handle.state.read();
                (run.pipeline_id == pipeline_id).then(|| run.clone())
            })
            .collect()
    }

    /// The most recent terminal run of a pipeline, by end time.
    #[must_use]
    pub fn latest_terminal_run(&self, pipeline_id: &str) -> Option<Run> {
        self.runs_for(pipeline_id)
            .into_iter()
            .filter(Run::is_terminal)
            .max_by_key(|run| run.ended_at)
    }
}
