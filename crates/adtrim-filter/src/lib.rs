//! Path-scoped JSON key removal for proxied response bodies.
//!
//! A filter holds an ordered list of endpoint rules. A request path selects
//! the first rule whose prefix matches; that rule's key set is then removed
//! recursively from the response document. Bodies that fail to parse as JSON
//! pass through byte-identical, so an upstream error page is never mangled.

use std::collections::HashSet;

use serde_json::Value;

/// Keys to strip from any response whose request path starts with `path_prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRule {
    pub path_prefix: String,
    pub remove_keys: HashSet<String>,
}

impl EndpointRule {
    pub fn new(path_prefix: impl Into<String>, remove_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            remove_keys: remove_keys.into_iter().collect(),
        }
    }
}

/// Ordered rule set; the first matching prefix wins.
#[derive(Debug, Clone, Default)]
pub struct ResponseFilter {
    rules: Vec<EndpointRule>,
}

impl ResponseFilter {
    pub fn new(rules: Vec<EndpointRule>) -> Self {
        Self { rules }
    }

    /// Whether any rule applies to this request path.
    pub fn should_filter(&self, path: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| path.starts_with(&rule.path_prefix))
    }

    /// Rewrite `body` under the first rule matching `path`.
    ///
    /// Returns the input unchanged when no rule matches, when the body is not
    /// valid JSON, or when re-encoding fails.
    pub fn apply(&self, path: &str, body: &[u8]) -> Vec<u8> {
        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| path.starts_with(&rule.path_prefix))
        else {
            return body.to_vec();
        };

        let Ok(document) = serde_json::from_slice::<Value>(body) else {
            return body.to_vec();
        };

        let cleaned = remove_keys(document, &rule.remove_keys);

        match serde_json::to_vec(&cleaned) {
            Ok(encoded) => encoded,
            Err(_) => body.to_vec(),
        }
    }
}

fn remove_keys(value: Value, keys: &HashSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !keys.contains(key))
                .map(|(key, child)| (key, remove_keys(child, keys)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| remove_keys(item, keys))
                .collect(),
        ),
        scalar => scalar,
    }
}
