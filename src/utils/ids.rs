//! Identifier generation.

use uuid::Uuid;

/// Generates a new run id.
#[must_use]
pub fn new_run_id() -> String {
    format!("run-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
    }
}
