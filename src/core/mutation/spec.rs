//! Declarative mutation and condition documents.
//!
//! Every discriminant is a closed enum, so an unknown `type`, `action`,
//! `transform` or `operator` fails deserialization when the route document
//! is loaded rather than surfacing while a request is in flight.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::pattern::Pattern;

/// One transform in a route's pre or post list, optionally guarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    #[serde(flatten)]
    pub op: MutationOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Mutation {
    pub fn new(op: MutationOp) -> Self {
        Self {
            op,
            condition: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationOp {
    Header(FieldOp),
    Query(FieldOp),
    Body(BodyTransform),
    Status(StatusOp),
}

/// Shared by header and query mutations. `value` is a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FieldOp {
    /// Write only when the key is absent.
    Add { key: String, value: String },
    Set { key: String, value: String },
    Remove { key: String },
    /// Move the value under a new key; no-op when the source is absent.
    Rename { key: String, to: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transform")]
pub enum BodyTransform {
    /// Copy dotted source paths into a fresh object at dotted target paths.
    #[serde(rename = "json_map", alias = "json-map")]
    JsonMap { mapping: BTreeMap<String, String> },
    #[serde(rename = "json_path", alias = "json-path")]
    JsonPath {
        path: String,
        #[serde(default)]
        target: Option<String>,
    },
    #[serde(rename = "template")]
    Template { template: String },
    /// Tenant-authored script evaluated in the sandbox; its value becomes the body.
    #[serde(rename = "function")]
    Function {
        code: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StatusOp {
    Override { code: u16 },
    /// Keys are upstream status codes as strings, e.g. `{"404": 200}`.
    Map { mapping: BTreeMap<String, u16> },
}

/// Guard deciding whether a mutation runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(flatten)]
    pub source: ConditionSource,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// `value` compiled for the `matches` operator; filled in by `flatten`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled: Option<Pattern>,
}

impl Condition {
    pub fn new(source: ConditionSource, operator: Operator, value: Option<serde_json::Value>) -> Self {
        Self {
            source,
            operator,
            value,
            compiled: None,
        }
    }

    /// Compile the `matches` pattern so evaluation never builds a regex.
    /// Other operators are left untouched.
    pub fn compile(&mut self) -> Result<(), String> {
        if self.operator != Operator::Matches {
            return Ok(());
        }
        let source = self
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| "'matches' needs a string value".to_string())?;
        let pattern = Pattern::new(source).map_err(|e| format!("invalid pattern: {e}"))?;
        self.compiled = Some(pattern);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSource {
    Header { key: String },
    Query { key: String },
    /// A named path parameter, or the request path itself when `key` is absent.
    Path {
        #[serde(default)]
        key: Option<String>,
    },
    Method,
    /// Response status; never present during the pre-request phase.
    Status,
    /// Rendered as a template; truthy unless empty, `null` or `undefined`.
    Expression { expression: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    Contains,
    Matches,
    Exists,
    Gt,
    Lt,
}
