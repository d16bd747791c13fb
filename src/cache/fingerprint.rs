//! Stable fingerprints for cacheable steps.

use crate::core::Step;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Serializes a JSON value with lexicographically ordered object keys at
/// every level, so logically equal configs hash identically.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Resolves `${VAR}` placeholders in a cache key template from the step's
/// resolved environment. Unknown variables resolve to the empty string.
#[must_use]
pub fn resolve_key_template(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                if let Some(value) = env.get(var) {
                    out.push_str(value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated placeholder; keep the literal text.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Derives the fingerprint for a cacheable step:
/// `SHA-256(pipeline_id || step_id || step_type || canonical(config) || resolved_key)`,
/// hex-encoded.
#[must_use]
pub fn step_fingerprint(pipeline_id: &str, step: &Step, resolved_key: &str) -> String {
    let config: serde_json::Value = serde_json::Value::Object(
        step.config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );

    let mut hasher = Sha256::new();
    hasher.update(pipeline_id.as_bytes());
    hasher.update([0]);
    hasher.update(step.id.as_bytes());
    hasher.update([0]);
    hasher.update(step.step_type.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(&config).as_bytes());
    hasher.update([0]);
    hasher.update(resolved_key.as_bytes());
    hex::encode(hasher.finalize())
}
