//! Conditional execution predicates.
//!
//! A `when` clause is a conjunction of up to three checks: a glob on the
//! run's branch param, a condition on the prior run's outcome, and a glob
//! on a resolved environment variable.

use crate::core::{RunStatus, StatusCondition, WhenClause};
use std::collections::HashMap;

/// The run-level facts a `when` clause is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// The branch this run was started for.
    pub branch: Option<String>,
    /// The outcome of the most recent terminal run of the same pipeline.
    pub prior_status: Option<RunStatus>,
}

/// Evaluates a `when` clause. All present checks must hold.
#[must_use]
pub fn evaluate(when: &WhenClause, ctx: &RunContext, env: &HashMap<String, String>) -> bool {
    if let Some(branch_glob) = &when.branch {
        let branch = ctx.branch.as_deref().unwrap_or("");
        if !glob_match(branch_glob, branch) {
            return false;
        }
    }

    if let Some(status) = when.status {
        let holds = match status {
            StatusCondition::Always => true,
            // A pipeline with no prior run counts as having succeeded.
            StatusCondition::OnSuccess => !matches!(
                ctx.prior_status,
                Some(RunStatus::Failed | RunStatus::Cancelled)
            ),
            StatusCondition::OnFailure => matches!(ctx.prior_status, Some(RunStatus::Failed)),
        };
        if !holds {
            return false;
        }
    }

    if let Some(pattern) = &when.pattern {
        let value = env.get(&pattern.var).map(String::as_str).unwrap_or("");
        if !glob_match(&pattern.matches, value) {
            return false;
        }
    }

    true
}

/// Matches a glob pattern supporting `*` (any run) and `?` (any single
/// character) against a value.
#[must_use]
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((star_p, star_v)) = star {
            // Backtrack: let the last star swallow one more character.
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match_basics() {
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "develop"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("release/*", "release/1.2"));
        assert!(!glob_match("release/*", "hotfix/1.2"));
        assert!(glob_match("v?", "v1"));
        assert!(!glob_match("v?", "v12"));
        assert!(glob_match("*-rc*", "1.0-rc2"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn test_branch_clause() {
        let when = WhenClause::branch("release/*");
        let env = HashMap::new();

        let ctx = RunContext {
            branch: Some("release/2.0".to_string()),
            prior_status: None,
        };
        assert!(evaluate(&when, &ctx, &env));

        let ctx = RunContext {
            branch: Some("main".to_string()),
            prior_status: None,
        };
        assert!(!evaluate(&when, &ctx, &env));

        // No branch param: only a wildcard matches.
        let ctx = RunContext::default();
        assert!(!evaluate(&when, &ctx, &env));
        assert!(evaluate(&WhenClause::branch("*"), &ctx, &env));
    }

    #[test]
    fn test_status_clause() {
        let env = HashMap::new();

        let on_success = WhenClause::status(StatusCondition::OnSuccess);
        let on_failure = WhenClause::status(StatusCondition::OnFailure);

        // No prior run counts as success.
        let ctx = RunContext::default();
        assert!(evaluate(&on_success, &ctx, &env));
        assert!(!evaluate(&on_failure, &ctx, &env));

        let ctx = RunContext {
            branch: None,
            prior_status: Some(RunStatus::Failed),
        };
        assert!(!evaluate(&on_success, &ctx, &env));
        assert!(evaluate(&on_failure, &ctx, &env));

        let always = WhenClause::status(StatusCondition::Always);
        assert!(evaluate(&always, &ctx, &env));
    }

    #[test]
    fn test_pattern_clause() {
        let when = WhenClause::pattern("DEPLOY_ENV", "prod*");
        let ctx = RunContext::default();

        let mut env = HashMap::new();
        env.insert("DEPLOY_ENV".to_string(), "production".to_string());
        assert!(evaluate(&when, &ctx, &env));

        env.insert("DEPLOY_ENV".to_string(), "staging".to_string());
        assert!(!evaluate(&when, &ctx, &env));

        env.remove("DEPLOY_ENV");
        assert!(!evaluate(&when, &ctx, &env));
    }

    #[test]
    fn test_clauses_are_conjunctive() {
        let mut when = WhenClause::branch("main");
        when.status = Some(StatusCondition::OnFailure);

        let env = HashMap::new();
        let ctx = RunContext {
            branch: Some("main".to_string()),
            prior_status: Some(RunStatus::Success),
        };
        // Branch matches but status check fails.
        assert!(!evaluate(&when, &ctx, &env));
    }

    #[test]
    fn test_empty_clause_always_true() {
        assert!(evaluate(
            &WhenClause::default(),
            &RunContext::default(),
            &HashMap::new()
        ));
    }
}
