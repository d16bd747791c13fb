//! # Conveyor
//!
//! A dependency-aware CI/CD pipeline execution engine.
//!
//! Conveyor accepts declarative pipeline definitions (stages of steps
//! with dependencies, retries, caching, and conditional execution),
//! schedules steps concurrently while honoring the dependency DAG,
//! memoizes step outputs through a content-addressed cache with
//! single-flight semantics, and broadcasts lifecycle events to
//! bounded-buffer subscribers.
//!
//! - **Two-scope DAG**: stages order through `needs`, steps within a
//!   stage through `dependsOn`; cycles are rejected at creation time
//! - **Bounded execution**: a worker pool caps concurrent step dispatch
//! - **Memoization**: fingerprinted steps build at most once per key;
//!   concurrent requesters await the leader's result
//! - **Observability**: every state transition emits exactly one event;
//!   slow subscribers drop events and expose drop counters
//! - **Cancellation**: a per-run token propagates into every plugin
//!   context
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.register_plugin(Arc::new(ShellPlugin::new()))?;
//!
//! let spec = PipelineSpec::new("ci", "Build and Test")
//!     .with_stage(Stage::new("build").with_step(Step::new("compile", "shell")))
//!     .with_stage(Stage::new("test").with_needs(["build"])
//!         .with_step(Step::new("unit", "shell")));
//! engine.create_pipeline(spec)?;
//!
//! let run_id = engine.execute_run("ci")?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cancellation;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod plugin;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{ArtifactCache, CacheDecision};
    pub use crate::cancellation::CancellationToken;
    pub use crate::core::{
        CachePolicy, Event, LogLevel, OutputMap, Pipeline, PipelineSpec, RetryPolicy, Run,
        RunParams, RunStatus, Stage, StatusCondition, Step, StepCacheConfig, StepState,
        StepStatus, WhenClause,
    };
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::errors::{EngineError, PluginError, StepErrorInfo, StepErrorKind};
    pub use crate::events::{EventBus, Subscription};
    pub use crate::graph::PipelineGraph;
    pub use crate::plugin::{Plugin, PluginManifest, PluginRegistry, StepContext};
    pub use crate::scheduler::{RunContext, Scheduler};
    pub use crate::store::PipelineStore;
}
