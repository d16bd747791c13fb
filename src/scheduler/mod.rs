//! Run engine: executes a pipeline to a terminal status.
//!
//! Each run is driven by one supervisor task. Stages are released in
//! waves as their `needs` complete; within a running stage, steps whose
//! `dependsOn` are satisfied are dispatched to a bounded worker pool.
//! Step tasks report transitions back over a channel; the supervisor is
//! the only writer of run state, so every status change pairs with
//! exactly one event emission.

mod backoff;
mod condition;

pub use backoff::Backoff;
pub use condition::{evaluate, glob_match, RunContext};

use crate::cache::{step_fingerprint, resolve_key_template, ArtifactCache, CacheDecision};
use crate::cancellation::CancellationToken;
use crate::core::{
    CachePolicy, Event, OutputMap, Pipeline, RunStatus, Step, StepStatus, WhenClause,
};
use crate::errors::{StepErrorInfo, StepErrorKind};
use crate::events::EventBus;
use crate::graph::PipelineGraph;
use crate::plugin::{LogSink, Plugin, PluginRegistry, StepContext};
use crate::store::RunHandle;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Skip reason for steps whose `when` predicate was false.
pub const SKIP_WHEN_NOT_MET: &str = "when_not_met";
/// Skip reason for steps and stages downstream of a failure.
pub const SKIP_UPSTREAM_FAILED: &str = "upstream_failed";

/// Shared execution machinery: worker pool, plugin registry, cache, bus.
pub struct Scheduler {
    registry: Arc<PluginRegistry>,
    cache: Arc<ArtifactCache>,
    bus: Arc<EventBus>,
    pool: Arc<Semaphore>,
    default_step_timeout: Option<Duration>,
}

impl Scheduler {
    /// Creates a scheduler with a worker pool of `pool_size` permits.
    #[must_use]
    pub fn new(
        registry: Arc<PluginRegistry>,
        cache: Arc<ArtifactCache>,
        bus: Arc<EventBus>,
        pool_size: usize,
        default_step_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            bus,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            default_step_timeout,
        })
    }

    /// Executes one run to a terminal status.
    ///
    /// Spawned as a detached supervisor task by the engine facade; the
    /// outcome is observable on the run record and the event bus.
    pub async fn run(
        self: Arc<Self>,
        pipeline: Arc<Pipeline>,
        graph: Arc<PipelineGraph>,
        handle: Arc<RunHandle>,
        run_ctx: RunContext,
    ) {
        let run_id = handle.update(|run| {
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
            run.id.clone()
        });
        self.bus.emit(Event::run_started(&pipeline.id, &run_id));

        let mut base_env = pipeline.environment.clone();
        base_env.extend(
            handle
                .snapshot()
                .params
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut driver = RunDriver {
            scheduler: self.clone(),
            pipeline: pipeline.clone(),
            graph: graph.clone(),
            handle: handle.clone(),
            run_id: run_id.clone(),
            cancel: handle.cancel_token().clone(),
            logs: LogSink::new(),
            run_ctx,
            base_env,
            stages: graph
                .stage_order()
                .iter()
                .filter_map(|id| {
                    let node = graph.stage(id)?;
                    Some((
                        id.clone(),
                        StageExec {
                            phase: StagePhase::Blocked,
                            remaining: node.steps.order.len(),
                            failed: false,
                            needs_remaining: node.needs.len(),
                            deps_remaining: node
                                .steps
                                .order
                                .iter()
                                .map(|s| {
                                    (s.clone(), node.steps.deps.get(s).map_or(0, HashSet::len))
                                })
                                .collect(),
                            dispatched: HashSet::new(),
                        },
                    ))
                })
                .collect(),
            tx,
            in_flight: 0,
        };

        for stage_id in graph.root_stages() {
            driver.activate_stage(&stage_id);
        }

        let mut cancel_handled = false;
        loop {
            if driver.in_flight == 0 && driver.all_stages_done() {
                break;
            }

            let cancel = driver.cancel.clone();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => driver.handle_msg(msg),
                    None => break,
                },
                () = cancel.cancelled(), if !cancel_handled => {
                    cancel_handled = true;
                    driver.sweep_cancel();
                }
            }
        }

        driver.finish();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("available_workers", &self.pool.available_permits())
            .field("default_step_timeout", &self.default_step_timeout)
            .finish()
    }
}

/// Terminal outcome of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Success,
    Failed,
    /// Skipped by its `when` predicate; satisfies dependents.
    SkippedWhen,
    /// Skipped because an upstream stage failed; propagates.
    SkippedUpstream,
    Cancelled,
}

impl StageOutcome {
    fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Success | Self::SkippedWhen)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::SkippedWhen | Self::SkippedUpstream => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StagePhase {
    Blocked,
    Running,
    Done(StageOutcome),
}

struct StageExec {
    phase: StagePhase,
    /// Steps not yet terminal.
    remaining: usize,
    /// Whether any step failed.
    failed: bool,
    /// Unresolved `needs` count.
    needs_remaining: usize,
    /// Per-step unresolved `dependsOn` count.
    deps_remaining: HashMap<String, usize>,
    /// Steps handed to the worker pool.
    dispatched: HashSet<String>,
}

/// Transition report from a step task to the supervisor.
enum StepMsg {
    Started {
        stage: String,
        step: String,
        attempt: u32,
        retry_error: Option<StepErrorInfo>,
    },
    Finished {
        stage: String,
        step: String,
        outcome: StepOutcome,
    },
}

enum StepOutcome {
    Success {
        outputs: OutputMap,
        attempts: u32,
        cached: bool,
    },
    Failed {
        error: StepErrorInfo,
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
    },
}

/// Per-run supervisor state.
struct RunDriver {
    scheduler: Arc<Scheduler>,
    pipeline: Arc<Pipeline>,
    graph: Arc<PipelineGraph>,
    handle: Arc<RunHandle>,
    run_id: String,
    cancel: Arc<CancellationToken>,
    logs: LogSink,
    run_ctx: RunContext,
    /// Pipeline environment overlaid with run params.
    base_env: HashMap<String, String>,
    stages: HashMap<String, StageExec>,
    tx: mpsc::UnboundedSender<StepMsg>,
    in_flight: usize,
}

impl RunDriver {
    fn all_stages_done(&self) -> bool {
        self.stages
            .values()
            .all(|s| matches!(s.phase, StagePhase::Done(_)))
    }

    /// Makes an eligible stage runnable (or skips it wholesale).
    fn activate_stage(&mut self, stage_id: &str) {
        if self.cancel.is_cancelled() {
            return;
        }

        let when = self
            .pipeline
            .stage(stage_id)
            .and_then(|s| s.when.clone());
        if let Some(when) = when {
            if !condition::evaluate(&when, &self.run_ctx, &self.base_env) {
                self.skip_stage(stage_id, StageOutcome::SkippedWhen, SKIP_WHEN_NOT_MET);
                return;
            }
        }

        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.phase = StagePhase::Running;
        }
        self.scheduler.bus.emit(Event::stage_started(
            &self.pipeline.id,
            &self.run_id,
            stage_id,
        ));
        debug!(run = %self.run_id, stage = %stage_id, "stage started");

        let ready: Vec<String> = self
            .stages
            .get(stage_id)
            .map(|exec| {
                exec.deps_remaining
                    .iter()
                    .filter(|(_, n)| **n == 0)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        self.consider_steps(stage_id, ready);

        self.check_stage_complete(stage_id);
    }

    /// Evaluates `when` and dispatches each ready step; when-skips
    /// cascade readiness to dependents.
    fn consider_steps(&mut self, stage_id: &str, ready: Vec<String>) {
        let mut worklist = ready;
        while let Some(step_id) = worklist.pop() {
            if self.cancel.is_cancelled() {
                return;
            }
            if self.step_status(&step_id).map_or(true, StepStatus::is_terminal) {
                continue;
            }
            let Some(step) = self
                .pipeline
                .stage(stage_id)
                .and_then(|s| s.step(&step_id))
                .cloned()
            else {
                continue;
            };

            let env = self.pipeline.resolve_environment(&step, &self.base_env);
            let run_when = step
                .when
                .as_ref()
                .map_or(true, |w: &WhenClause| condition::evaluate(w, &self.run_ctx, &env));

            if run_when {
                self.dispatch_step(stage_id, step, env);
            } else {
                self.mark_skipped(&step_id, SKIP_WHEN_NOT_MET);
                if let Some(exec) = self.stages.get_mut(stage_id) {
                    exec.remaining -= 1;
                }
                // A when-skip satisfies dependents as if it succeeded.
                worklist.extend(self.satisfy_dependents(stage_id, &step_id));
            }
        }
    }

    /// Decrements dependents' unresolved counts; returns the newly ready.
    fn satisfy_dependents(&mut self, stage_id: &str, step_id: &str) -> Vec<String> {
        let dependents: Vec<String> = self
            .graph
            .stage(stage_id)
            .and_then(|node| node.steps.dependents.get(step_id))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut ready = Vec::new();
        if let Some(exec) = self.stages.get_mut(stage_id) {
            for dependent in dependents {
                if let Some(count) = exec.deps_remaining.get_mut(&dependent) {
                    if *count > 0 {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dependent);
                        }
                    }
                }
            }
        }
        ready
    }

    /// Spawns the worker task for one step.
    fn dispatch_step(&mut self, stage_id: &str, step: Step, env: HashMap<String, String>) {
        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.dispatched.insert(step.id.clone());
        }
        self.in_flight += 1;

        let task = StepTask {
            scheduler: self.scheduler.clone(),
            pipeline: self.pipeline.clone(),
            stage_id: stage_id.to_string(),
            run_id: self.run_id.clone(),
            cancel: self.cancel.clone(),
            logs: self.logs.clone(),
            tx: self.tx.clone(),
        };
        tokio::spawn(task.execute(step, env));
    }

    fn handle_msg(&mut self, msg: StepMsg) {
        match msg {
            StepMsg::Started {
                stage,
                step,
                attempt,
                retry_error,
            } => self.on_started(&stage, &step, attempt, retry_error),
            StepMsg::Finished {
                stage,
                step,
                outcome,
            } => self.on_finished(&stage, &step, outcome),
        }
    }

    fn on_started(
        &mut self,
        _stage: &str,
        step_id: &str,
        attempt: u32,
        retry_error: Option<StepErrorInfo>,
    ) {
        self.handle.update(|run| {
            if let Some(state) = run.steps.get_mut(step_id) {
                if !state.status.is_terminal() {
                    state.status = StepStatus::Running;
                    state.attempts = attempt;
                    if state.started_at.is_none() {
                        state.started_at = Some(Utc::now());
                    }
                }
            }
        });

        let event = match retry_error {
            None => Event::step_started(&self.pipeline.id, &self.run_id, step_id),
            Some(error) => {
                Event::step_retried(&self.pipeline.id, &self.run_id, step_id, attempt, &error)
            }
        };
        self.scheduler.bus.emit(event);
    }

    fn on_finished(&mut self, stage_id: &str, step_id: &str, outcome: StepOutcome) {
        self.in_flight -= 1;
        self.drain_logs();

        if self.step_status(step_id).map_or(false, StepStatus::is_terminal) {
            // Raced with the cancellation sweep; the step is already
            // accounted for.
            return;
        }

        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.remaining -= 1;
        }

        match outcome {
            StepOutcome::Success {
                outputs,
                attempts,
                cached,
            } => {
                let exit_code = outputs.get("exitCode").and_then(serde_json::Value::as_i64);
                self.handle.update(|run| {
                    if let Some(state) = run.steps.get_mut(step_id) {
                        state.status = StepStatus::Success;
                        state.ended_at = Some(Utc::now());
                        state.attempts = attempts;
                        state.outputs = outputs;
                        state.cached = cached;
                        state.exit_code = exit_code;
                    }
                });
                self.scheduler.bus.emit(Event::step_completed(
                    &self.pipeline.id,
                    &self.run_id,
                    step_id,
                    StepStatus::Success,
                    attempts,
                    cached,
                ));

                let ready = self.satisfy_dependents(stage_id, step_id);
                self.consider_steps(stage_id, ready);
            }
            StepOutcome::Failed { error, attempts } => {
                warn!(
                    run = %self.run_id,
                    step = %step_id,
                    error = %error,
                    "step failed"
                );
                self.handle.update(|run| {
                    if let Some(state) = run.steps.get_mut(step_id) {
                        state.status = StepStatus::Failed;
                        state.ended_at = Some(Utc::now());
                        state.attempts = attempts;
                        state.error = Some(error.clone());
                    }
                });
                self.scheduler
                    .bus
                    .emit(
                        Event::step_completed(
                            &self.pipeline.id,
                            &self.run_id,
                            step_id,
                            StepStatus::Failed,
                            attempts,
                            false,
                        )
                        .with_data("error", serde_json::json!(error)),
                    );

                if let Some(exec) = self.stages.get_mut(stage_id) {
                    exec.failed = true;
                }
                self.skip_downstream_steps(stage_id, step_id);
            }
            StepOutcome::Cancelled { attempts } => {
                self.handle.update(|run| {
                    if let Some(state) = run.steps.get_mut(step_id) {
                        state.status = StepStatus::Cancelled;
                        state.ended_at = Some(Utc::now());
                        state.attempts = attempts;
                        state.error =
                            Some(StepErrorInfo::new(StepErrorKind::Cancelled, "run cancelled"));
                    }
                });
                self.scheduler.bus.emit(Event::step_cancelled(
                    &self.pipeline.id,
                    &self.run_id,
                    step_id,
                ));
            }
        }

        self.check_stage_complete(stage_id);
    }

    /// Marks every transitive intra-stage dependent of a failed step as
    /// skipped with reason `upstream_failed`.
    fn skip_downstream_steps(&mut self, stage_id: &str, failed_step: &str) {
        let downstream = self
            .graph
            .stage(stage_id)
            .map(|node| node.steps.transitive_dependents(failed_step))
            .unwrap_or_default();

        for step_id in downstream {
            if self.step_status(&step_id).map_or(true, StepStatus::is_terminal) {
                continue;
            }
            let dispatched = self
                .stages
                .get(stage_id)
                .map_or(false, |exec| exec.dispatched.contains(&step_id));
            if dispatched {
                continue;
            }
            self.mark_skipped(&step_id, SKIP_UPSTREAM_FAILED);
            if let Some(exec) = self.stages.get_mut(stage_id) {
                exec.remaining -= 1;
            }
        }
    }

    /// Finalizes a stage once no steps remain, cascading to dependents.
    fn check_stage_complete(&mut self, stage_id: &str) {
        let Some(exec) = self.stages.get(stage_id) else {
            return;
        };
        if exec.phase != StagePhase::Running || exec.remaining > 0 {
            return;
        }

        let outcome = if exec.failed {
            StageOutcome::Failed
        } else if self.cancel.is_cancelled() && self.stage_has_cancelled_step(stage_id) {
            StageOutcome::Cancelled
        } else {
            StageOutcome::Success
        };
        self.finalize_stage(stage_id, outcome);
    }

    fn stage_has_cancelled_step(&self, stage_id: &str) -> bool {
        let run = self.handle.snapshot();
        self.graph.stage(stage_id).map_or(false, |node| {
            node.steps
                .order
                .iter()
                .any(|id| run.step(id).map_or(false, |s| s.status == StepStatus::Cancelled))
        })
    }

    fn finalize_stage(&mut self, stage_id: &str, outcome: StageOutcome) {
        if let Some(exec) = self.stages.get_mut(stage_id) {
            if matches!(exec.phase, StagePhase::Done(_)) {
                return;
            }
            exec.phase = StagePhase::Done(outcome);
        }
        self.scheduler.bus.emit(Event::stage_completed(
            &self.pipeline.id,
            &self.run_id,
            stage_id,
            outcome.label(),
        ));
        debug!(run = %self.run_id, stage = %stage_id, outcome = outcome.label(), "stage completed");

        let dependents: Vec<String> = self
            .graph
            .stage(stage_id)
            .map(|node| node.dependents.iter().cloned().collect())
            .unwrap_or_default();

        if outcome.satisfies_dependents() {
            for dependent in dependents {
                let eligible = {
                    let Some(exec) = self.stages.get_mut(&dependent) else {
                        continue;
                    };
                    if exec.phase != StagePhase::Blocked {
                        continue;
                    }
                    exec.needs_remaining -= 1;
                    exec.needs_remaining == 0
                };
                if eligible {
                    self.activate_stage(&dependent);
                }
            }
        } else if matches!(outcome, StageOutcome::Failed | StageOutcome::SkippedUpstream) {
            for dependent in dependents {
                let blocked = self
                    .stages
                    .get(&dependent)
                    .map_or(false, |e| e.phase == StagePhase::Blocked);
                if blocked {
                    self.skip_stage(&dependent, StageOutcome::SkippedUpstream, SKIP_UPSTREAM_FAILED);
                }
            }
        }
    }

    /// Skips an entire stage: every non-terminal step is marked skipped.
    fn skip_stage(&mut self, stage_id: &str, outcome: StageOutcome, reason: &str) {
        let steps: Vec<String> = self
            .graph
            .stage(stage_id)
            .map(|node| node.steps.order.clone())
            .unwrap_or_default();
        for step_id in steps {
            if self.step_status(&step_id).map_or(true, StepStatus::is_terminal) {
                continue;
            }
            self.mark_skipped(&step_id, reason);
        }
        if let Some(exec) = self.stages.get_mut(stage_id) {
            exec.remaining = 0;
        }
        self.finalize_stage(stage_id, outcome);
    }

    fn mark_skipped(&mut self, step_id: &str, reason: &str) {
        self.handle.update(|run| {
            if let Some(state) = run.steps.get_mut(step_id) {
                state.status = StepStatus::Skipped;
                state.ended_at = Some(Utc::now());
                state.skip_reason = Some(reason.to_string());
            }
        });
        self.scheduler.bus.emit(Event::step_skipped(
            &self.pipeline.id,
            &self.run_id,
            step_id,
            reason,
        ));
    }

    /// On cancellation: every undispatched step is cancelled without
    /// dispatch; in-flight steps report their own cancelled outcomes.
    fn sweep_cancel(&mut self) {
        debug!(run = %self.run_id, "cancellation sweep");
        let stage_ids: Vec<String> = self.graph.stage_order().to_vec();

        for stage_id in stage_ids {
            let (phase, dispatched) = match self.stages.get(&stage_id) {
                Some(exec) => (exec.phase, exec.dispatched.clone()),
                None => continue,
            };
            match phase {
                StagePhase::Done(_) => {}
                StagePhase::Blocked => {
                    let steps: Vec<String> = self
                        .graph
                        .stage(&stage_id)
                        .map(|node| node.steps.order.clone())
                        .unwrap_or_default();
                    for step_id in &steps {
                        self.mark_cancelled_without_dispatch(step_id);
                    }
                    if let Some(exec) = self.stages.get_mut(&stage_id) {
                        exec.remaining = 0;
                    }
                    self.finalize_stage(&stage_id, StageOutcome::Cancelled);
                }
                StagePhase::Running => {
                    let pending: Vec<String> = self
                        .graph
                        .stage(&stage_id)
                        .map(|node| {
                            node.steps
                                .order
                                .iter()
                                .filter(|id| {
                                    !dispatched.contains(*id)
                                        && !self
                                            .step_status(id)
                                            .map_or(true, StepStatus::is_terminal)
                                })
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();

                    for step_id in &pending {
                        self.mark_cancelled_without_dispatch(step_id);
                        if let Some(exec) = self.stages.get_mut(&stage_id) {
                            exec.remaining -= 1;
                        }
                    }
                    self.check_stage_complete(&stage_id);
                }
            }
        }
    }

    fn mark_cancelled_without_dispatch(&mut self, step_id: &str) {
        self.handle.update(|run| {
            if let Some(state) = run.steps.get_mut(step_id) {
                if !state.status.is_terminal() {
                    state.status = StepStatus::Cancelled;
                    state.ended_at = Some(Utc::now());
                }
            }
        });
        self.scheduler.bus.emit(Event::step_cancelled(
            &self.pipeline.id,
            &self.run_id,
            step_id,
        ));
    }

    fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.handle.snapshot().step(step_id).map(|s| s.status)
    }

    fn drain_logs(&self) {
        let entries = self.logs.drain();
        if !entries.is_empty() {
            self.handle.update(|run| run.logs.extend(entries));
        }
    }

    /// Records the terminal run status and emits the closing event.
    fn finish(&mut self) {
        self.drain_logs();

        let failed = self
            .stages
            .values()
            .any(|s| matches!(s.phase, StagePhase::Done(StageOutcome::Failed)));
        let status = if self.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        self.handle.update(|run| {
            run.status = status;
            run.ended_at = Some(Utc::now());
        });

        let event = if status == RunStatus::Cancelled {
            Event::run_cancelled(&self.pipeline.id, &self.run_id)
        } else {
            Event::run_completed(&self.pipeline.id, &self.run_id, status)
        };
        self.scheduler.bus.emit(event);
        debug!(run = %self.run_id, status = %status, "run finished");
    }
}

/// Everything a spawned step task needs.
struct StepTask {
    scheduler: Arc<Scheduler>,
    pipeline: Arc<Pipeline>,
    stage_id: String,
    run_id: String,
    cancel: Arc<CancellationToken>,
    logs: LogSink,
    tx: mpsc::UnboundedSender<StepMsg>,
}

impl StepTask {
    fn send(&self, msg: StepMsg) {
        // The supervisor outlives its steps; a send can only fail during
        // teardown, where the message is moot.
        let _ = self.tx.send(msg);
    }

    fn finish(&self, step_id: &str, outcome: StepOutcome) {
        self.send(StepMsg::Finished {
            stage: self.stage_id.clone(),
            step: step_id.to_string(),
            outcome,
        });
    }

    async fn execute(self, step: Step, env: HashMap<String, String>) {
        // A worker permit bounds concurrency; waiting for one is still
        // "pending" as far as cancellation is concerned.
        let pool = self.scheduler.pool.clone();
        let permit = tokio::select! {
            () = self.cancel.cancelled() => {
                self.finish(&step.id, StepOutcome::Cancelled { attempts: 0 });
                return;
            }
            permit = pool.acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            self.finish(&step.id, StepOutcome::Cancelled { attempts: 0 });
            return;
        };

        let plugin = match &step.plugin {
            Some(name) => self.scheduler.registry.get(name),
            None => self.scheduler.registry.resolve(&step.step_type),
        };
        let Some(plugin) = plugin else {
            self.finish(
                &step.id,
                StepOutcome::Failed {
                    error: StepErrorInfo::new(
                        StepErrorKind::UnknownStepType,
                        format!("no plugin registered for step type '{}'", step.step_type),
                    ),
                    attempts: 0,
                },
            );
            return;
        };

        // Cache interaction. An explicit key template names a shared
        // identity, so the fingerprint drops the step id; without one
        // the memo stays scoped to this step.
        let cache_cfg = self.pipeline.effective_cache(&step);
        let fingerprint = cache_cfg.as_ref().map(|cfg| {
            let resolved_key = cfg
                .key
                .as_deref()
                .map(|template| resolve_key_template(template, &env))
                .unwrap_or_default();
            let fp = if cfg.key.is_some() {
                let mut anonymous = step.clone();
                anonymous.id = String::new();
                step_fingerprint(&self.pipeline.id, &anonymous, &resolved_key)
            } else {
                step_fingerprint(&self.pipeline.id, &step, &resolved_key)
            };
            (fp, cfg.policy.unwrap_or_default())
        });

        loop {
            let leader = match &fingerprint {
                None => None,
                Some((fp, CachePolicy::ReadOnly)) => {
                    if let Some(outputs) = self.scheduler.cache.lookup(fp) {
                        self.finish(
                            &step.id,
                            StepOutcome::Success {
                                outputs,
                                attempts: 0,
                                cached: true,
                            },
                        );
                        return;
                    }
                    None
                }
                Some((fp, _)) => match self.scheduler.cache.lookup_or_start(fp) {
                    CacheDecision::Hit(outputs) => {
                        self.finish(
                            &step.id,
                            StepOutcome::Success {
                                outputs,
                                attempts: 0,
                                cached: true,
                            },
                        );
                        return;
                    }
                    CacheDecision::Follower(handle) => {
                        tokio::select! {
                            () = self.cancel.cancelled() => {
                                self.finish(&step.id, StepOutcome::Cancelled { attempts: 0 });
                                return;
                            }
                            result = handle.wait() => match result {
                                Ok(outputs) => {
                                    self.finish(
                                        &step.id,
                                        StepOutcome::Success {
                                            outputs,
                                            attempts: 0,
                                            cached: true,
                                        },
                                    );
                                    return;
                                }
                                // The leader failed; re-enter the lookup
                                // and possibly lead a fresh attempt.
                                Err(_) => continue,
                            }
                        }
                    }
                    CacheDecision::Leader(token) => Some(token),
                },
            };

            let outcome = self.attempt_loop(&step, &env, plugin.as_ref(), leader).await;
            self.finish(&step.id, outcome);
            return;
        }
    }

    /// Runs the retry loop for one step, publishing to the cache when
    /// leading.
    async fn attempt_loop(
        &self,
        step: &Step,
        env: &HashMap<String, String>,
        plugin: &dyn Plugin,
        leader: Option<crate::cache::LeaderToken>,
    ) -> StepOutcome {
        let mut leader = leader;
        let max_attempts = step.max_attempts();
        let backoff = step.retry.as_ref().map(Backoff::from_policy);
        let timeout = step.timeout.or(self.scheduler.default_step_timeout);
        let mut retry_error: Option<StepErrorInfo> = None;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                if let Some(token) = leader.take() {
                    token.fail("run cancelled");
                }
                return StepOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            self.send(StepMsg::Started {
                stage: self.stage_id.clone(),
                step: step.id.clone(),
                attempt,
                retry_error: retry_error.take(),
            });

            let deadline = timeout.map(|t| Instant::now() + t);
            let ctx = StepContext::new(
                self.pipeline.id.clone(),
                self.run_id.clone(),
                step.id.clone(),
                attempt,
                self.cancel.clone(),
                deadline,
                env.clone(),
                self.logs.clone(),
                self.scheduler.bus.clone(),
            );

            let result = {
                let exec = plugin.execute(&ctx, step);
                match timeout {
                    Some(limit) => tokio::select! {
                        () = self.cancel.cancelled() => {
                            if let Some(token) = leader.take() {
                                token.fail("run cancelled");
                            }
                            return StepOutcome::Cancelled { attempts: attempt };
                        }
                        res = tokio::time::timeout(limit, exec) => match res {
                            Ok(Ok(outputs)) => Ok(outputs),
                            Ok(Err(err)) => {
                                Err(StepErrorInfo::new(StepErrorKind::Plugin, err.message))
                            }
                            Err(_) => Err(StepErrorInfo::timeout(limit)),
                        },
                    },
                    None => tokio::select! {
                        () = self.cancel.cancelled() => {
                            if let Some(token) = leader.take() {
                                token.fail("run cancelled");
                            }
                            return StepOutcome::Cancelled { attempts: attempt };
                        }
                        res = exec => {
                            res.map_err(|err| StepErrorInfo::new(StepErrorKind::Plugin, err.message))
                        }
                    },
                }
            };

            match result {
                Ok(outputs) => {
                    if let Some(token) = leader.take() {
                        token.publish(outputs.clone());
                    }
                    return StepOutcome::Success {
                        outputs,
                        attempts: attempt,
                        cached: false,
                    };
                }
                Err(error) => {
                    if attempt < max_attempts && error.kind.is_retryable() {
                        let delay = backoff.as_ref().map(|b| b.delay(attempt)).unwrap_or_default();
                        if !delay.is_zero() {
                            tokio::select! {
                                () = self.cancel.cancelled() => {
                                    if let Some(token) = leader.take() {
                                        token.fail("run cancelled");
                                    }
                                    return StepOutcome::Cancelled { attempts: attempt };
                                }
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                        retry_error = Some(error);
                    } else {
                        if let Some(token) = leader.take() {
                            token.fail(error.message.clone());
                        }
                        return StepOutcome::Failed {
                            error,
                            attempts: attempt,
                        };
                    }
                }
            }
        }

        // The loop always returns from its final iteration.
        StepOutcome::Failed {
            error: StepErrorInfo::new(StepErrorKind::Plugin, "retry loop exhausted"),
            attempts: max_attempts,
        }
    }
}
