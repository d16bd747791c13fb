//! Shared utilities: identifiers, timestamps, and ISO-8601 durations.

pub mod duration;
mod ids;
mod timestamps;

pub use duration::{format_duration, parse_duration, DurationError};
pub use ids::new_run_id;
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
