//! `{{path}}` template resolution against a [`Scope`].
//!
//! Unresolved tokens are left in place and reported back to the caller; they
//! never fail a turn.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use parley_types::{stringify, Scope};

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template token pattern is valid")
});

/// Result of resolving a template or a config tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    /// Paths of tokens that did not resolve, in order of appearance.
    pub missing: Vec<String>,
}

/// Resolve every `{{path}}` token in `template`.
///
/// A template that is exactly one token yields the bound value itself, so a
/// number or list reaches the adapter untouched. Otherwise each token is
/// stringified into the surrounding text.
pub fn resolve(template: &str, scope: &Scope) -> Resolution {
    let mut missing = Vec::new();

    if let Some(caps) = TOKEN.captures(template) {
        let whole = caps.get(0).map(|m| m.range());
        if whole == Some(0..template.len()) {
            let path = caps[1].trim();
            return match scope.lookup(path) {
                Some(value) => Resolution {
                    value: value.clone(),
                    missing,
                },
                None => Resolution {
                    value: Value::String(template.to_string()),
                    missing: vec![path.to_string()],
                },
            };
        }
    }

    let rendered = TOKEN.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = caps[1].trim();
        match scope.lookup(path) {
            Some(value) => stringify(value),
            None => {
                missing.push(path.to_string());
                caps[0].to_string()
            }
        }
    });

    Resolution {
        value: Value::String(rendered.into_owned()),
        missing,
    }
}

/// Resolve every string inside a JSON tree. Object keys are left untouched.
pub fn resolve_value(value: &Value, scope: &Scope) -> Resolution {
    let mut missing = Vec::new();
    let value = resolve_into(value, scope, &mut missing);
    Resolution { value, missing }
}

fn resolve_into(value: &Value, scope: &Scope, missing: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) if s.contains("{{") => {
            let resolution = resolve(s, scope);
            missing.extend(resolution.missing);
            resolution.value
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_into(item, scope, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_into(v, scope, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Paths referenced by `{{..}}` tokens in a string.
pub fn referenced_paths(template: &str) -> Vec<String> {
    TOKEN
        .captures_iter(template)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}
