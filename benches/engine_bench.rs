//! Benchmarks for graph validation and end-to-end run execution.

use conveyor::core::{PipelineSpec, Stage, Step};
use conveyor::engine::{Engine, EngineConfig};
use conveyor::graph::PipelineGraph;
use conveyor::testing::MockPlugin;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

fn wide_pipeline(stages: usize, steps_per_stage: usize) -> PipelineSpec {
    let mut spec = PipelineSpec::new("bench", "bench");
    for s in 0..stages {
        let mut stage = Stage::new(format!("stage{s}"));
        if s > 0 {
            stage = stage.with_needs([format!("stage{}", s - 1)]);
        }
        for i in 0..steps_per_stage {
            let mut step = Step::new(format!("s{s}-{i}"), "noop");
            if i > 0 {
                step = step.depends_on([format!("s{s}-0")]);
            }
            stage = stage.with_step(step);
        }
        spec = spec.with_stage(stage);
    }
    spec
}

fn graph_build_benchmark(c: &mut Criterion) {
    let pipeline = wide_pipeline(10, 20).normalize();
    c.bench_function("graph_build_10x20", |b| {
        b.iter(|| PipelineGraph::build(black_box(&pipeline)).unwrap());
    });
}

fn run_execution_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = Engine::new(EngineConfig::default());
    engine
        .register_plugin(Arc::new(MockPlugin::new("noop-runner", ["noop"])))
        .unwrap();
    engine.create_pipeline(wide_pipeline(3, 5)).unwrap();

    c.bench_function("run_3x5", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let run_id = engine.execute_run("bench").unwrap();
                loop {
                    let run = engine.get_run("bench", &run_id).unwrap();
                    if run.is_terminal() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_micros(200)).await;
                }
            });
        });
    });
}

criterion_group!(benches, graph_build_benchmark, run_execution_benchmark);
criterion_main!(benches);
