use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use super::path;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([^}]+?)\s*\}").expect("placeholder regex is valid"));

/// Render `${a.b[0].c}` placeholders against `scope`.
///
/// Unresolved placeholders stay verbatim in the output.
pub fn render<'t>(template: &'t str, scope: &Value) -> Cow<'t, str> {
    PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match path::lookup(scope, &caps[1]) {
            Some(value) => stringify(value),
            None => caps[0].to_string(),
        }
    })
}

/// True when the template contains at least one placeholder.
pub fn has_placeholders(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

/// Text form of a resolved value: strings verbatim, everything else as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
