//! Test support: mock plugins and pipeline fixtures.
//!
//! Available to this crate's tests and to downstream crates that want to
//! exercise engine behavior without real step implementations.

mod fixtures;
mod mocks;

pub use fixtures::{linear_pipeline, parallel_pipeline, single_step_pipeline};
pub use mocks::{FnPlugin, MockPlugin};
