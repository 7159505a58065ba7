//! Dotted-path access into JSON values and the minimal JSONPath subset.
//!
//! Dotted paths look like `user.addresses[0].city`: each segment is a field
//! name optionally followed by one `[index]`. JSONPath expressions add a `$`
//! root and `[*]` array expansion on top of that.
use serde_json::{Map, Value};

use super::MutationError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Index {
    At(usize),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment<'a> {
    field: &'a str,
    index: Option<Index>,
}

fn parse_segment(raw: &str) -> Option<Segment<'_>> {
    let raw = raw.trim();
    match raw.find('[') {
        None => Some(Segment {
            field: raw,
            index: None,
        }),
        Some(open) => {
            let inner = raw[open + 1..].strip_suffix(']')?;
            let index = match inner.trim() {
                "*" => Index::All,
                n => Index::At(n.parse().ok()?),
            };
            Some(Segment {
                field: &raw[..open],
                index: Some(index),
            })
        }
    }
}

fn strip_root(path: &str) -> &str {
    let path = path.trim();
    if path == "$" {
        ""
    } else {
        path.strip_prefix("$.").unwrap_or(path)
    }
}

fn step<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    if field.is_empty() {
        Some(value)
    } else {
        value.as_object()?.get(field)
    }
}

/// Resolve a dotted path. Wildcard indices never resolve here.
pub fn lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let path = strip_root(path);
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for raw in path.split('.') {
        let segment = parse_segment(raw)?;
        current = step(current, segment.field)?;
        match segment.index {
            None => {}
            Some(Index::At(i)) => current = current.as_array()?.get(i)?,
            Some(Index::All) => return None,
        }
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects.
/// Indexed segments in a target path are written as plain fields.
pub fn assign(root: &mut Value, path: &str, value: Value) {
    let path = strip_root(path);
    if path.is_empty() {
        *root = value;
        return;
    }
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        let key = segment.trim().to_string();
        if segments.peek().is_none() {
            map.insert(key, value);
            return;
        }
        current = map.entry(key).or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Evaluate a JSONPath expression limited to `$`, `.field`, `[n]` and `[*]`.
///
/// Without a wildcard the single match is returned; with one, every match is
/// collected into an array (possibly empty).
pub fn evaluate_json_path(root: &Value, expression: &str) -> Result<Value, MutationError> {
    let expression = expression.trim();
    if !(expression == "$" || expression.starts_with("$.") || expression.starts_with("$[")) {
        return Err(MutationError::InvalidExpression(expression.to_string()));
    }
    let body = expression.strip_prefix('$').unwrap_or_default();
    let body = body.strip_prefix('.').unwrap_or(body);

    let mut current: Vec<&Value> = vec![root];
    let mut expanded = false;
    if !body.is_empty() {
        for raw in body.split('.') {
            let segment = parse_segment(raw)
                .ok_or_else(|| MutationError::InvalidExpression(expression.to_string()))?;
            let mut next = Vec::with_capacity(current.len());
            for value in current {
                let Some(field) = step(value, segment.field) else {
                    continue;
                };
                match &segment.index {
                    None => next.push(field),
                    Some(Index::At(i)) => {
                        if let Some(item) = field.as_array().and_then(|a| a.get(*i)) {
                            next.push(item);
                        }
                    }
                    Some(Index::All) => {
                        if let Some(items) = field.as_array() {
                            next.extend(items.iter());
                        }
                    }
                }
            }
            if matches!(segment.index, Some(Index::All)) {
                expanded = true;
            }
            current = next;
        }
    }

    if expanded {
        Ok(Value::Array(current.into_iter().cloned().collect()))
    } else {
        current
            .first()
            .map(|v| (*v).clone())
            .ok_or_else(|| MutationError::MissingPath(expression.to_string()))
    }
}
