//! Pipeline definitions: stages, steps, and their policies.
//!
//! [`PipelineSpec`] is the submission shape (JSON-equivalent interchange,
//! camelCase fields). [`Pipeline`] is the validated, normalized form the
//! engine stores: flat-step specs are folded into a single implicit stage
//! and sequential stages are chained before the graph is built.

use crate::utils::duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Name of the implicit stage created for flat-step pipelines.
pub const IMPLICIT_STAGE: &str = "main";

/// A declarative pipeline definition as submitted by a caller.
///
/// Either `stages` or the flat `steps` list may be populated; flat steps
/// are normalized into a single implicit stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Caller-supplied stable id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Ordered stage list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    /// Flat step list; mutually exclusive with `stages` in practice,
    /// normalized into an implicit stage when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Advisory trigger rules; not interpreted by the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    /// Cache defaults applied to steps that declare a cache config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<PipelineCacheDefaults>,
    /// Pipeline-wide environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineSpec {
    /// Creates an empty spec with the given id and name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a flat step (implicit-stage shape).
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the pipeline environment.
    #[must_use]
    pub fn with_environment(mut self, env: HashMap<String, String>) -> Self {
        self.environment = env;
        self
    }

    /// Sets the cache defaults.
    #[must_use]
    pub fn with_cache_defaults(mut self, defaults: PipelineCacheDefaults) -> Self {
        self.cache = Some(defaults);
        self
    }

    /// Normalizes the spec into a stored [`Pipeline`].
    ///
    /// Flat steps become a single implicit stage; stages marked
    /// `parallel: false` have their listed steps chained; empty step and
    /// stage names default to the corresponding id.
    #[must_use]
    pub fn normalize(self) -> Pipeline {
        let mut stages = self.stages;
        if stages.is_empty() && !self.steps.is_empty() {
            stages.push(Stage {
                id: IMPLICIT_STAGE.to_string(),
                name: IMPLICIT_STAGE.to_string(),
                steps: self.steps,
                ..Stage::default()
            });
        }

        for stage in &mut stages {
            if stage.name.is_empty() {
                stage.name = stage.id.clone();
            }
            if !stage.parallel {
                let ids: Vec<String> = stage.steps.iter().map(|s| s.id.clone()).collect();
                for (i, step) in stage.steps.iter_mut().enumerate().skip(1) {
                    let prev = &ids[i - 1];
                    if !step.depends_on.contains(prev) {
                        step.depends_on.push(prev.clone());
                    }
                }
            }
            for step in &mut stage.steps {
                if step.name.is_empty() {
                    step.name = step.id.clone();
                }
            }
        }

        Pipeline {
            id: self.id,
            name: self.name,
            description: self.description,
            stages,
            triggers: self.triggers,
            cache: self.cache,
            environment: self.environment,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}

/// A validated, normalized pipeline definition.
///
/// Immutable after creation; updates are modelled as delete + create
/// preserving `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Caller-supplied stable id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Ordered stage list (never empty after validation).
    pub stages: Vec<Stage>,
    /// Advisory trigger rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    /// Cache defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<PipelineCacheDefaults>,
    /// Pipeline-wide environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Creation time, preserved across updates.
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Looks up a stage by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Total number of steps across all stages.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Resolves the environment for a step: pipeline-wide variables,
    /// overlaid by run params, overlaid by the step's own overrides.
    #[must_use]
    pub fn resolve_environment(
        &self,
        step: &Step,
        params_env: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env = self.environment.clone();
        env.extend(params_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(step.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Resolves the effective cache config for a step: the step's own
    /// config with missing key/policy filled from the pipeline defaults.
    /// Steps without a cache config are not cached.
    #[must_use]
    pub fn effective_cache(&self, step: &Step) -> Option<StepCacheConfig> {
        let mut config = step.cache.clone()?;
        if let Some(defaults) = &self.cache {
            if config.key.is_none() {
                config.key = defaults.key.clone();
            }
            if config.policy.is_none() {
                config.policy = defaults.policy;
            }
        }
        if config.policy.unwrap_or_default() == CachePolicy::Disabled {
            return None;
        }
        Some(config)
    }
}

/// A named group of steps with optional inter-stage ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Unique stage id within the pipeline.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// The steps of this stage.
    pub steps: Vec<Step>,
    /// Ids of stages that must complete successfully first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Conditional predicate gating the whole stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,
    /// When false, listed steps are chained sequentially at
    /// normalization time. Defaults to true.
    #[serde(default = "default_true")]
    pub parallel: bool,
}

impl Default for Stage {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            steps: Vec::new(),
            needs: Vec::new(),
            when: None,
            parallel: true,
        }
    }
}

impl Stage {
    /// Creates an empty stage.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the stages this stage needs.
    #[must_use]
    pub fn with_needs(mut self, needs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the stage-level predicate.
    #[must_use]
    pub fn with_when(mut self, when: WhenClause) -> Self {
        self.when = Some(when);
        self
    }

    /// Marks the stage sequential.
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Looks up a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

fn default_true() -> bool {
    true
}

/// A unit of work executed by a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique step id within the pipeline.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: String,
    /// Step type, resolved through the plugin registry.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Explicit plugin name overriding the type lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Command hint delivered to the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Image hint delivered to the plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Per-step environment overrides.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Opaque configuration delivered to the plugin.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
    /// Conditional predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,
    /// Retry policy; absent means a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Absolute step timeout.
    #[serde(
        default,
        with = "duration::iso_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Cache configuration; absent means no memoization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<StepCacheConfig>,
    /// Intra-stage dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Declared output names plugins may populate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Step {
    /// Creates a step with the given id and type.
    #[must_use]
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            ..Self::default()
        }
    }

    /// Sets the intra-stage dependencies.
    #[must_use]
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the step timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the cache configuration.
    #[must_use]
    pub fn with_cache(mut self, cache: StepCacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the conditional predicate.
    #[must_use]
    pub fn with_when(mut self, when: WhenClause) -> Self {
        self.when = Some(when);
        self
    }

    /// Sets an opaque config entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Total number of attempts allowed: `retry.maxAttempts` or 1.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }
}

/// Retry behavior for transient step failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    #[serde(with = "duration::iso")]
    pub interval: Duration,
    /// When true, the delay doubles on each failed attempt.
    #[serde(default)]
    pub exponential: bool,
    /// Cap on the computed delay.
    #[serde(
        default,
        with = "duration::iso_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_interval: Option<Duration>,
    /// When true, a full random jitter is applied to the delay.
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Creates a constant-interval policy.
    #[must_use]
    pub fn constant(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            exponential: false,
            max_interval: None,
            jitter: false,
        }
    }

    /// Creates an exponential-backoff policy.
    #[must_use]
    pub fn exponential(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            exponential: true,
            max_interval: None,
            jitter: false,
        }
    }
}

/// How a step interacts with the artifact cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Look up before executing and publish on success.
    #[default]
    ReadWrite,
    /// Look up only; never publish.
    ReadOnly,
    /// Caching disabled for this step.
    Disabled,
}

/// Per-step cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCacheConfig {
    /// Key template; `${VAR}` placeholders resolve from the step's
    /// environment. Folded into the fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Declared artifact paths (advisory, delivered to the plugin).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    /// Cache policy; inherits the pipeline default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CachePolicy>,
}

impl StepCacheConfig {
    /// Creates an enabled cache config with the given key template.
    #[must_use]
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Creates an enabled cache config with no key template.
    #[must_use]
    pub fn enabled() -> Self {
        Self::default()
    }
}

/// Pipeline-level cache defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCacheDefaults {
    /// Default key template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Default policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CachePolicy>,
}

/// Conditional predicate on a step or stage.
///
/// All present clauses must hold for the step to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhenClause {
    /// Glob matched against the run's branch param (`*` and `?`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Condition on the prior run's outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusCondition>,
    /// Glob matched against a variable in the resolved environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<EnvPattern>,
}

impl WhenClause {
    /// Predicate on the branch param.
    #[must_use]
    pub fn branch(glob: impl Into<String>) -> Self {
        Self {
            branch: Some(glob.into()),
            ..Self::default()
        }
    }

    /// Predicate on the prior run's status.
    #[must_use]
    pub fn status(status: StatusCondition) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Predicate on an environment variable.
    #[must_use]
    pub fn pattern(var: impl Into<String>, glob: impl Into<String>) -> Self {
        Self {
            pattern: Some(EnvPattern {
                var: var.into(),
                matches: glob.into(),
            }),
            ..Self::default()
        }
    }
}

/// Status condition relative to the prior run of the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCondition {
    /// Run regardless of the prior outcome.
    Always,
    /// Run only if the prior run succeeded (no prior run counts as success).
    OnSuccess,
    /// Run only if the prior run failed.
    OnFailure,
}

/// Glob match against a resolved environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvPattern {
    /// The variable name.
    pub var: String,
    /// The glob pattern (`*` and `?`).
    pub matches: String,
}

/// Advisory trigger metadata; stored, never interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// The triggering event kind (e.g. "push", "schedule").
    pub on: String,
    /// Branch filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Cron expression for scheduled triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}
