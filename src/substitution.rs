//! Parameter Substitution Engine (C6): wires one task's result into
//! another task's params via `${task_id.path}` references.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("unresolved reference ${{{task_id}.{path}}}")]
    UnresolvedReference { task_id: String, path: String },
}

/// A single `${task_id.path}` occurrence found in a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub whole_match: &'a str,
    pub task_id: &'a str,
    pub path: &'a str,
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_\-]+)\.([A-Za-z0-9_.\-]+)\}").expect("static pattern is valid"))
}

/// Find every `${task_id.path}` reference in `s`, left to right.
pub fn find_references(s: &str) -> Vec<Reference<'_>> {
    reference_pattern()
        .captures_iter(s)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            Reference {
                whole_match: &s[whole.start()..whole.end()],
                task_id: caps.get(1).unwrap().as_str(),
                path: caps.get(2).unwrap().as_str(),
            }
        })
        .collect()
}

/// Resolve a dot-separated path (field names or integer array indices)
/// against `root`.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Substitute every `${task_id.path}` reference in `params` against results
/// produced by `resolve_task`, recursively over maps and lists.
///
/// Pure function of `(params, resolve_task)` — neither is mutated. Rules:
/// - If an entire string value is exactly one reference, the referenced
///   value replaces it with its native type preserved.
/// - If a reference is a substring of a longer string, the referenced value
///   is stringified (JSON-serialized unless already a string) and spliced
///   in. Substitution within strings is single-pass.
pub fn substitute<'a, F>(params: &Value, resolve_task: F) -> Result<Value, SubstitutionError>
where
    F: Fn(&str) -> Option<&'a Value> + Copy,
{
    match params {
        Value::String(s) => substitute_string(s, resolve_task),
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|v| substitute(v, resolve_task)).collect::<Result<Vec<_>, _>>()?,
        )),
        Value::Object(map) => Ok(Value::Object(
            map.iter()
                .map(|(k, v)| substitute(v, resolve_task).map(|sv| (k.clone(), sv)))
                .collect::<Result<serde_json::Map<_, _>, _>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn substitute_string<'a, F>(s: &str, resolve_task: F) -> Result<Value, SubstitutionError>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    let refs = find_references(s);
    if refs.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    if refs.len() == 1 && refs[0].whole_match == s {
        let reference = &refs[0];
        return lookup(reference, &resolve_task).map(|v| v.clone());
    }

    let mut out = String::with_capacity(s.len());
    let mut last_end = 0;
    for reference in &refs {
        let start = s[last_end..].find(reference.whole_match).map(|p| p + last_end).unwrap_or(last_end);
        out.push_str(&s[last_end..start]);
        let value = lookup(reference, &resolve_task)?;
        match value {
            Value::String(inner) => out.push_str(inner),
            other => out.push_str(&serde_json::to_string(other).unwrap_or_default()),
        }
        last_end = start + reference.whole_match.len();
    }
    out.push_str(&s[last_end..]);
    Ok(Value::String(out))
}

fn lookup<'a>(reference: &Reference<'_>, resolve_task: impl Fn(&str) -> Option<&'a Value>) -> Result<&'a Value, SubstitutionError> {
    let result = resolve_task(reference.task_id).ok_or_else(|| SubstitutionError::UnresolvedReference {
        task_id: reference.task_id.to_string(),
        path: reference.path.to_string(),
    })?;
    resolve_path(result, reference.path).ok_or_else(|| SubstitutionError::UnresolvedReference {
        task_id: reference.task_id.to_string(),
        path: reference.path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_fn(results: &HashMap<&str, Value>) -> impl Fn(&str) -> Option<&Value> + Copy + '_ {
        move |id: &str| results.get(id)
    }

    #[test]
    fn whole_value_reference_preserves_native_type() {
        let mut results = HashMap::new();
        results.insert("a", serde_json::json!({"result": {"items": [1, 2, 3]}}));
        let params = serde_json::json!({"xs": "${a.result.items}"});

        let out = substitute(&params, lookup_fn(&results)).unwrap();
        assert_eq!(out, serde_json::json!({"xs": [1, 2, 3]}));
    }

    #[test]
    fn substring_reference_is_stringified() {
        let mut results = HashMap::new();
        results.insert("t2", serde_json::json!({"y": 10}));
        let params = serde_json::json!({"s": "got ${t2.y}"});

        let out = substitute(&params, lookup_fn(&results)).unwrap();
        assert_eq!(out, serde_json::json!({"s": "got 10"}));
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let results: HashMap<&str, Value> = HashMap::new();
        let params = serde_json::json!({"n": "${missing.x}"});
        assert!(substitute(&params, lookup_fn(&results)).is_err());
    }

    #[test]
    fn recurses_through_nested_lists_and_maps() {
        let mut results = HashMap::new();
        results.insert("b1", serde_json::json!({"r": 2}));
        results.insert("b2", serde_json::json!({"r": 4}));
        results.insert("b3", serde_json::json!({"r": 6}));
        let params = serde_json::json!({"xs": ["${b1.r}", "${b2.r}", "${b3.r}"]});

        let out = substitute(&params, lookup_fn(&results)).unwrap();
        assert_eq!(out, serde_json::json!({"xs": [2, 4, 6]}));
    }

    #[test]
    fn substitution_within_strings_is_single_pass() {
        let mut results = HashMap::new();
        results.insert("a", serde_json::json!({"x": "${not.a.reference}"}));
        let params = serde_json::json!("value: ${a.x}");

        let out = substitute(&params, lookup_fn(&results)).unwrap();
        assert_eq!(out, Value::String("value: ${not.a.reference}".to_string()));
    }

    #[test]
    fn resolve_path_walks_arrays_and_objects() {
        let value = serde_json::json!({"items": [{"score": 0.5}, {"score": 0.9}]});
        assert_eq!(resolve_path(&value, "items.1.score"), Some(&serde_json::json!(0.9)));
    }
}
