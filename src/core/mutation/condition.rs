use std::borrow::Cow;

use regex::Regex;
use serde_json::Value;

use super::{
    spec::{Condition, ConditionSource, Operator},
    template,
};
use crate::core::context::RequestContext;

/// What a condition can observe while a mutation list is running.
pub struct ConditionInput<'a> {
    pub context: &'a RequestContext,
    /// Upstream status; `None` during the pre-request phase.
    pub status: Option<u16>,
    /// Template scope used by `expression` conditions.
    pub scope: &'a Value,
}

pub fn evaluate(condition: &Condition, input: &ConditionInput<'_>) -> bool {
    let ctx = input.context;
    let resolved: Option<Cow<'_, str>> = match &condition.source {
        ConditionSource::Header { key } => ctx
            .headers
            .get(&key.to_ascii_lowercase())
            .map(|v| Cow::Borrowed(v.as_str())),
        ConditionSource::Query { key } => ctx.query.get(key).map(|v| Cow::Borrowed(v.as_str())),
        ConditionSource::Path { key: Some(key) } => {
            ctx.params.get(key).map(|v| Cow::Borrowed(v.as_str()))
        }
        ConditionSource::Path { key: None } => Some(Cow::Borrowed(ctx.path.as_str())),
        ConditionSource::Method => Some(Cow::Borrowed(ctx.method.as_str())),
        ConditionSource::Status => input.status.map(|s| Cow::Owned(s.to_string())),
        ConditionSource::Expression { expression } => {
            return is_truthy(&template::render(expression, input.scope));
        }
    };

    if condition.operator == Operator::Matches {
        return resolved.is_some_and(|actual| pattern_matches(condition, &actual));
    }

    let expected = condition.value.as_ref().map(expected_text);
    compare(
        condition.operator,
        resolved.as_deref(),
        expected.as_deref(),
        matches!(condition.source, ConditionSource::Method),
    )
}

fn pattern_matches(condition: &Condition, actual: &str) -> bool {
    if let Some(pattern) = &condition.compiled {
        return pattern.is_match(actual);
    }
    // Only conditions built outside a snapshot get here.
    let Some(source) = condition.value.as_ref().map(expected_text) else {
        return false;
    };
    match Regex::new(&source) {
        Ok(re) => re.is_match(actual),
        Err(e) => {
            tracing::warn!("Condition pattern '{}' is invalid: {}", source, e);
            false
        }
    }
}

fn expected_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    !(trimmed.is_empty() || trimmed == "null" || trimmed == "undefined")
}

fn compare(
    operator: Operator,
    actual: Option<&str>,
    expected: Option<&str>,
    case_insensitive: bool,
) -> bool {
    if operator == Operator::Exists {
        // `value: false` inverts the check.
        let want_present = expected != Some("false");
        return actual.is_some() == want_present;
    }
    let (Some(actual), Some(expected)) = (actual, expected) else {
        return false;
    };
    match operator {
        Operator::Equals if case_insensitive => actual.eq_ignore_ascii_case(expected),
        Operator::Equals => actual == expected,
        Operator::Contains => actual.contains(expected),
        Operator::Gt | Operator::Lt => {
            match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) if operator == Operator::Gt => a > b,
                (Ok(a), Ok(b)) => a < b,
                _ => false,
            }
        }
        Operator::Exists | Operator::Matches => unreachable!("handled above"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::context::tests::sample_context;

    fn check(condition: Condition, status: Option<u16>) -> bool {
        let ctx = sample_context();
        let scope = ctx.template_scope(ctx.body_json(), None);
        evaluate(
            &condition,
            &ConditionInput {
                context: &ctx,
                status,
                scope: &scope,
            },
        )
    }

    #[test]
    fn test_header_conditions() {
        let exists = Condition::new(
            ConditionSource::Header {
                key: "X-Debug".into(),
            },
            Operator::Exists,
            None,
        );
        assert!(check(exists, None));

        let absent = Condition::new(
            ConditionSource::Header {
                key: "x-missing".into(),
            },
            Operator::Exists,
            Some(json!(false)),
        );
        assert!(check(absent, None));

        let contains = Condition::new(
            ConditionSource::Header {
                key: "user-agent".into(),
            },
            Operator::Contains,
            Some(json!("curl")),
        );
        assert!(check(contains, None));
    }

    #[test]
    fn test_method_equals_is_case_insensitive() {
        let cond = Condition::new(ConditionSource::Method, Operator::Equals, Some(json!("post")));
        assert!(check(cond, None));
    }

    #[test]
    fn test_path_param_matches_regex() {
        let cond = Condition::new(
            ConditionSource::Path {
                key: Some("id".into()),
            },
            Operator::Matches,
            Some(json!("^[0-9]+$")),
        );
        assert!(check(cond, None));
    }

    #[test]
    fn test_compiled_pattern_is_used_for_matches() {
        let mut cond = Condition::new(
            ConditionSource::Path {
                key: Some("id".into()),
            },
            Operator::Matches,
            Some(json!("^[0-9]+$")),
        );
        cond.compile().unwrap();
        assert_eq!(cond.compiled.as_ref().map(|p| p.as_str()), Some("^[0-9]+$"));
        assert!(check(cond.clone(), None));

        // Evaluation reads the compiled pattern, not the raw value.
        cond.value = Some(json!("(["));
        assert!(check(cond, None));

        let mut invalid = Condition::new(ConditionSource::Method, Operator::Matches, Some(json!("([")));
        assert!(invalid.compile().is_err());
        let mut not_text = Condition::new(ConditionSource::Method, Operator::Matches, Some(json!(7)));
        assert!(not_text.compile().is_err());
    }

    #[test]
    fn test_status_comparisons() {
        let gt = Condition::new(ConditionSource::Status, Operator::Gt, Some(json!(399)));
        assert!(check(gt.clone(), Some(404)));
        assert!(!check(gt.clone(), Some(200)));
        // No status before the upstream call.
        assert!(!check(gt, None));

        let lt = Condition::new(ConditionSource::Status, Operator::Lt, Some(json!("300")));
        assert!(check(lt, Some(204)));
    }

    #[test]
    fn test_expression_truthiness() {
        let truthy = Condition::new(
            ConditionSource::Expression {
                expression: "${body.name}".into(),
            },
            Operator::Equals,
            None,
        );
        assert!(check(truthy, None));

        let unresolved = Condition::new(
            ConditionSource::Expression {
                expression: "${body.nothing}".into(),
            },
            Operator::Equals,
            None,
        );
        // Unresolved placeholders render verbatim, which is non-empty.
        assert!(check(unresolved, None));

        let null = Condition::new(
            ConditionSource::Expression {
                expression: "${body.gone}".into(),
            },
            Operator::Equals,
            None,
        );
        assert!(!check(null, None));
    }
}
