//! Cooperative cancellation.
//!
//! Each run owns a root [`CancellationToken`]; the same token is threaded
//! into every step context so plugins and scheduler waits observe the
//! signal promptly.

mod token;

pub use token::{CancelCallback, CancellationToken};
