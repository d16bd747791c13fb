//! Ready-made pipeline specs for tests.

use crate::core::{PipelineSpec, Stage, Step};

/// A single stage with one step of the given type.
#[must_use]
pub fn single_step_pipeline(id: &str, step_type: &str) -> PipelineSpec {
    PipelineSpec::new(id, id)
        .with_stage(Stage::new("main").with_step(Step::new("only", step_type)))
}

/// A single stage whose steps form a chain: each depends on the previous.
#[must_use]
pub fn linear_pipeline(id: &str, step_type: &str, step_ids: &[&str]) -> PipelineSpec {
    let mut stage = Stage::new("main");
    let mut prev: Option<&str> = None;
    for step_id in step_ids {
        let mut step = Step::new(*step_id, step_type);
        if let Some(prev) = prev {
            step = step.depends_on([prev]);
        }
        stage = stage.with_step(step);
        prev = Some(step_id);
    }
    PipelineSpec::new(id, id).with_stage(stage)
}

/// A single stage whose steps have no dependencies.
#[must_use]
pub fn parallel_pipeline(id: &str, step_type: &str, step_ids: &[&str]) -> PipelineSpec {
    let mut stage = Stage::new("main");
    for step_id in step_ids {
        stage = stage.with_step(Step::new(*step_id, step_type));
    }
    PipelineSpec::new(id, id).with_stage(stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_pipeline_chains() {
        let spec = linear_pipeline("p", "shell", &["a", "b", "c"]);
        let pipeline = spec.normalize();
        let stage = pipeline.stage("main").unwrap();
        assert!(stage.step("a").unwrap().depends_on.is_empty());
        assert_eq!(stage.step("b").unwrap().depends_on, vec!["a"]);
        assert_eq!(stage.step("c").unwrap().depends_on, vec!["b"]);
    }

    #[test]
    fn test_parallel_pipeline_is_flat() {
        let pipeline = parallel_pipeline("p", "shell", &["a", "b"]).normalize();
        let stage = pipeline.stage("main").unwrap();
        assert!(stage.steps.iter().all(|s| s.depends_on.is_empty()));
    }
}
