//! Dependency graph construction and validation.
//!
//! A pipeline carries two overlaid graphs: stages ordered by `needs` and,
//! within each stage, steps ordered by `dependsOn`. They are kept as
//! separate scopes so stage-level skipping propagates without touching
//! step edges. Validation runs Kahn's algorithm on each scope; nodes left
//! unconsumed form a cycle.

use crate::core::Pipeline;
use crate::errors::ValidationError;
use std::collections::{HashMap, HashSet, VecDeque};

/// The immutable dependency structure of a validated pipeline.
///
/// Built once at pipeline creation and shared by `Arc` into every run.
#[derive(Debug)]
pub struct PipelineGraph {
    /// Stage ids in definition order.
    stage_order: Vec<String>,
    /// Per-stage dependency structure.
    stages: HashMap<String, StageNode>,
}

/// Dependency structure of one stage.
#[derive(Debug)]
pub struct StageNode {
    /// Stages that must succeed before this one is eligible.
    pub needs: HashSet<String>,
    /// Stages whose `needs` include this one.
    pub dependents: HashSet<String>,
    /// The intra-stage step graph.
    pub steps: StepGraph,
}

/// Step-level dependency structure within one stage.
#[derive(Debug, Default)]
pub struct StepGraph {
    /// Step ids in definition order.
    pub order: Vec<String>,
    /// Step id → the steps it depends on.
    pub deps: HashMap<String, HashSet<String>>,
    /// Step id → the steps that depend on it.
    pub dependents: HashMap<String, HashSet<String>>,
}

impl StepGraph {
    /// All steps transitively downstream of `step_id`.
    #[must_use]
    pub fn transitive_dependents(&self, step_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(step_id);

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.dependents.get(current) {
                for dep in dependents {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        seen
    }
}

impl PipelineGraph {
    /// Builds and validates the graph for a normalized pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] on empty pipelines, duplicate ids,
    /// unknown references, cross-stage `dependsOn`, or cycles.
    pub fn build(pipeline: &Pipeline) -> Result<Self, ValidationError> {
        if pipeline.stages.is_empty() || pipeline.step_count() == 0 {
            return Err(ValidationError::Empty {
                pipeline: pipeline.id.clone(),
            });
        }

        // Stage ids must be unique; step ids must be unique pipeline-wide.
        let mut stage_ids = HashSet::new();
        let mut step_owner: HashMap<&str, &str> = HashMap::new();
        for stage in &pipeline.stages {
            if !stage_ids.insert(stage.id.as_str()) {
                return Err(ValidationError::DuplicateId {
                    scope: "stage",
                    id: stage.id.clone(),
                });
            }
            for step in &stage.steps {
                if step_owner.insert(&step.id, &stage.id).is_some() {
                    return Err(ValidationError::DuplicateId {
                        scope: "step",
                        id: step.id.clone(),
                    });
                }
            }
        }

        let mut stages = HashMap::new();
        let mut stage_order = Vec::with_capacity(pipeline.stages.len());

        for stage in &pipeline.stages {
            let mut needs = HashSet::new();
            for needed in &stage.needs {
                if !stage_ids.contains(needed.as_str()) {
                    return Err(ValidationError::UnknownReference {
                        scope: "stage",
                        from: stage.id.clone(),
                        to: needed.clone(),
                    });
                }
                needs.insert(needed.clone());
            }

            let mut steps = StepGraph::default();
            for step in &stage.steps {
                steps.order.push(step.id.clone());
                steps.deps.entry(step.id.clone()).or_default();
                steps.dependents.entry(step.id.clone()).or_default();
            }
            for step in &stage.steps {
                for dep in &step.depends_on {
                    match step_owner.get(dep.as_str()) {
                        None => {
                            return Err(ValidationError::UnknownReference {
                                scope: "step",
                                from: step.id.clone(),
                                to: dep.clone(),
                            });
                        }
                        Some(owner) if *owner != stage.id => {
                            return Err(ValidationError::CrossStageDependency {
                                step: step.id.clone(),
                                dependency: dep.clone(),
                                other_stage: (*owner).to_string(),
                            });
                        }
                        Some(_) => {
                            if let Some(set) = steps.deps.get_mut(&step.id) {
                                set.insert(dep.clone());
                            }
                            if let Some(set) = steps.dependents.get_mut(dep) {
                                set.insert(step.id.clone());
                            }
                        }
                    }
                }
            }

            check_acyclic("step", &steps.order, &steps.deps)?;

            stage_order.push(stage.id.clone());
            stages.insert(
                stage.id.clone(),
                StageNode {
                    needs,
                    dependents: HashSet::new(),
                    steps,
                },
            );
        }

        // Reverse stage edges.
        let edges: Vec<(String, String)> = stages
            .iter()
            .flat_map(|(id, node)| {
                node.needs
                    .iter()
                    .map(move |needed| (needed.clone(), id.clone()))
            })
            .collect();
        for (needed, dependent) in edges {
            if let Some(node) = stages.get_mut(&needed) {
                node.dependents.insert(dependent);
            }
        }

        let stage_deps: HashMap<String, HashSet<String>> = stages
            .iter()
            .map(|(id, node)| (id.clone(), node.needs.clone()))
            .collect();
        check_acyclic("stage", &stage_order, &stage_deps)?;

        Ok(Self {
            stage_order,
            stages,
        })
    }

    /// Stage ids in definition order.
    #[must_use]
    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }

    /// Looks up a stage node.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageNode> {
        self.stages.get(id)
    }

    /// Stages with no `needs`: the first wave.
    #[must_use]
    pub fn root_stages(&self) -> Vec<String> {
        self.stage_order
            .iter()
            .filter(|id| {
                self.stages
                    .get(*id)
                    .map_or(false, |node| node.needs.is_empty())
            })
            .cloned()
            .collect()
    }
}

/// Kahn's algorithm: consume all nodes or report the leftover cycle.
fn check_acyclic(
    scope: &'static str,
    order: &[String],
    deps: &HashMap<String, HashSet<String>>,
) -> Result<(), ValidationError> {
    let mut in_degree: HashMap<&str, usize> = order
        .iter()
        .map(|id| (id.as_str(), deps.get(id).map_or(0, HashSet::len)))
        .collect();

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, dep_set) in deps {
        for dep in dep_set {
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = order
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut consumed = 0;
    while let Some(current) = queue.pop_front() {
        consumed += 1;
        if let Some(next) = dependents.get(current) {
            for &id in next {
                if let Some(degree) = in_degree.get_mut(id) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(id);
                    }
                }
            }
        }
    }

    if consumed == order.len() {
        Ok(())
    } else {
        let members = order
            .iter()
            .filter(|id| in_degree.get(id.as_str()).map_or(false, |d| *d > 0))
            .cloned()
            .collect();
        Err(ValidationError::Cycle { scope, members })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineSpec, Stage, Step};

    fn two_stage_pipeline() -> Pipeline {
        PipelineSpec::new("p1", "test")
            .with_stage(
                Stage::new("build")
                    .with_step(Step::new("compile", "shell"))
                    .with_step(Step::new("package", "shell").depends_on(["compile"])),
            )
            .with_stage(
                Stage::new("test")
                    .with_needs(["build"])
                    .with_step(Step::new("unit", "shell")),
            )
            .normalize()
    }

    #[test]
    fn test_build_valid_graph() {
        let graph = PipelineGraph::build(&two_stage_pipeline()).unwrap();
        assert_eq!(graph.stage_order(), &["build", "test"]);
        assert_eq!(graph.root_stages(), vec!["build"]);

        let build = graph.stage("build").unwrap();
        assert!(build.dependents.contains("test"));
        assert_eq!(
            build.steps.deps["package"],
            HashSet::from(["compile".to_string()])
        );
        assert!(build.steps.dependents["compile"].contains("package"));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let pipeline = PipelineSpec::new("p1", "empty").normalize();
        assert!(matches!(
            PipelineGraph::build(&pipeline),
            Err(ValidationError::Empty { .. })
        ));
    }

    #[test]
    fn test_duplicate_step_id_rejected_across_stages() {
        let pipeline = PipelineSpec::new("p1", "dup")
            .with_stage(Stage::new("a").with_step(Step::new("s", "shell")))
            .with_stage(Stage::new("b").with_step(Step::new("s", "shell")))
            .normalize();
        assert!(matches!(
            PipelineGraph::build(&pipeline),
            Err(ValidationError::DuplicateId { scope: "step", .. })
        ));
    }

    #[test]
    fn test_unknown_needs_rejected() {
        let pipeline = PipelineSpec::new("p1", "bad")
            .with_stage(
                Stage::new("a")
                    .with_needs(["nope"])
                    .with_step(Step::new("s", "shell")),
            )
            .normalize();
        assert!(matches!(
            PipelineGraph::build(&pipeline),
            Err(ValidationError::UnknownReference { scope: "stage", .. })
        ));
    }

    #[test]
    fn test_unknown_depends_on_rejected() {
        let pipeline = PipelineSpec::new("p1", "bad")
            .with_stage(Stage::new("a").with_step(Step::new("s", "shell").depends_on(["ghost"])))
            .normalize();
        assert!(matches!(
            PipelineGraph::build(&pipeline),
            Err(ValidationError::UnknownReference { scope: "step", .. })
        ));
    }

    #[test]
    fn test_cross_stage_depends_on_rejected() {
        let pipeline = PipelineSpec::new("p1", "bad")
            .with_stage(Stage::new("a").with_step(Step::new("x", "shell")))
            .with_stage(Stage::new("b").with_step(Step::new("y", "shell").depends_on(["x"])))
            .normalize();
        let err = PipelineGraph::build(&pipeline).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::CrossStageDependency { ref other_stage, .. } if other_stage == "a"
        ));
    }

    #[test]
    fn test_step_cycle_rejected() {
        let pipeline = PipelineSpec::new("p1", "cyclic")
            .with_stage(
                Stage::new("a")
                    .with_step(Step::new("x", "shell").depends_on(["y"]))
                    .with_step(Step::new("y", "shell").depends_on(["x"])),
            )
            .normalize();
        let err = PipelineGraph::build(&pipeline).unwrap_err();
        match err {
            ValidationError::Cycle { scope, members } => {
                assert_eq!(scope, "step");
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_stage_cycle_rejected() {
        let pipeline = PipelineSpec::new("p1", "cyclic")
            .with_stage(
                Stage::new("a")
                    .with_needs(["b"])
                    .with_step(Step::new("x", "shell")),
            )
            .with_stage(
                Stage::new("b")
                    .with_needs(["a"])
                    .with_step(Step::new("y", "shell")),
            )
            .normalize();
        assert!(matches!(
            PipelineGraph::build(&pipeline),
            Err(ValidationError::Cycle { scope: "stage", .. })
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let pipeline = PipelineSpec::new("p1", "selfdep")
            .with_stage(Stage::new("a").with_step(Step::new("x", "shell").depends_on(["x"])))
            .normalize();
        assert!(matches!(
            PipelineGraph::build(&pipeline),
            Err(ValidationError::Cycle { scope: "step", .. })
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let pipeline = PipelineSpec::new("p1", "chain")
            .with_stage(
                Stage::new("a")
                    .with_step(Step::new("s1", "shell"))
                    .with_step(Step::new("s2", "shell").depends_on(["s1"]))
                    .with_step(Step::new("s3", "shell").depends_on(["s2"]))
                    .with_step(Step::new("other", "shell")),
            )
            .normalize();
        let graph = PipelineGraph::build(&pipeline).unwrap();
        let downstream = graph.stage("a").unwrap().steps.transitive_dependents("s1");
        assert_eq!(
            downstream,
            HashSet::from(["s2".to_string(), "s3".to_string()])
        );
    }

    #[test]
    fn test_diamond_graph_valid() {
        let pipeline = PipelineSpec::new("p1", "diamond")
            .with_stage(
                Stage::new("a")
                    .with_step(Step::new("root", "shell"))
                    .with_step(Step::new("left", "shell").depends_on(["root"]))
                    .with_step(Step::new("right", "shell").depends_on(["root"]))
                    .with_step(Step::new("join", "shell").depends_on(["left", "right"])),
            )
            .normalize();
        assert!(PipelineGraph::build(&pipeline).is_ok());
    }
}
