//! `{{name}}` placeholder substitution.
//!
//! Resolution is a single pass: a substituted value that itself contains
//! `{{...}}` is left as-is, so expansion always terminates.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("failed to compile placeholder regex")
});

/// Render a variable value for insertion into text.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{name}}` in `text` whose name is defined in `vars`.
///
/// Unknown names are left untouched.
pub fn substitute(text: &str, vars: &HashMap<String, Value>) -> String {
    if vars.is_empty() || !text.contains("{{") {
        return text.to_string();
    }

    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(value) => render(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Apply [`substitute`] to every string leaf of `value`, keeping its shape.
pub fn substitute_deep(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, vars)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_deep(item, vars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_deep(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn substitute_map(
    map: &HashMap<String, String>,
    vars: &HashMap<String, Value>,
) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute(v, vars)))
        .collect()
}

/// Names of all placeholders in `text`, in order of appearance.
pub fn extract_variables(text: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Layer case headers over environment base headers; case headers win.
pub fn merge_headers(
    base: &HashMap<String, String>,
    case_headers: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = base.clone();
    for (name, value) in case_headers {
        // Header names are case-insensitive on the wire.
        merged.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        merged.insert(name.clone(), value.clone());
    }
    merged
}
