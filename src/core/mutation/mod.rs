//! Mutation engine: conditional header, query, body and status transforms.
//!
//! A route carries two ordered lists, `pre` (applied to the request before it
//! is forwarded) and `post` (applied to the upstream response). Each entry is
//! applied in declared order. A failing entry is logged and skipped with the
//! target left exactly as it was before that entry; the rest of the list
//! still runs.
use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub mod condition;
pub mod path;
pub mod script;
pub mod spec;
pub mod template;

pub use script::{ScriptInput, ScriptSandbox};
pub use spec::{
    BodyTransform, Condition, ConditionSource, FieldOp, Mutation, MutationOp, Operator, StatusOp,
};

use crate::{
    config::ScriptLimits,
    core::{context::RequestContext, flatten::FlattenedRoute},
    utils::headers::header_map_to_json,
};

/// Why a single mutation could not be applied.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MutationError {
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(String),

    #[error("Invalid header value for '{0}'")]
    InvalidHeaderValue(String),

    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    #[error("Body is not valid JSON")]
    NotJson,

    #[error("Path not found: {0}")]
    MissingPath(String),

    #[error("Unsupported expression: {0}")]
    InvalidExpression(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Script exceeded its {0:?} deadline")]
    ScriptTimeout(Duration),

    #[error("{0} mutations do not apply to the {1} phase")]
    NotApplicable(&'static str, &'static str),
}

/// The request as it will be forwarded upstream.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
}

/// The upstream response as it will be returned to the client.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseParts {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Standard reason phrase for the current status.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("Unknown")
    }
}

/// Result of running one phase.
#[derive(Debug, Clone)]
pub struct Mutated<T> {
    pub value: T,
    /// Mutations whose condition held and that applied without error.
    pub applied: usize,
}

/// A request or response that mutations can be applied to.
trait MutationTarget {
    const PHASE: &'static str;

    fn headers_mut(&mut self) -> &mut HeaderMap;
    fn body(&self) -> &Bytes;
    fn set_body(&mut self, body: Bytes);
    fn query_mut(&mut self) -> Option<&mut BTreeMap<String, String>>;
    fn status_mut(&mut self) -> Option<&mut StatusCode>;
    fn status(&self) -> Option<u16>;
    fn response_scope(&self) -> Option<Value>;
}

impl MutationTarget for RequestParts {
    const PHASE: &'static str = "pre-request";

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    fn query_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        Some(&mut self.query)
    }

    fn status_mut(&mut self) -> Option<&mut StatusCode> {
        None
    }

    fn status(&self) -> Option<u16> {
        None
    }

    fn response_scope(&self) -> Option<Value> {
        None
    }
}

impl MutationTarget for ResponseParts {
    const PHASE: &'static str = "post-response";

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    fn query_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
        None
    }

    fn status_mut(&mut self) -> Option<&mut StatusCode> {
        Some(&mut self.status)
    }

    fn status(&self) -> Option<u16> {
        Some(self.status.as_u16())
    }

    fn response_scope(&self) -> Option<Value> {
        Some(json!({
            "status": self.status.as_u16(),
            "status_text": self.status_text(),
            "headers": header_map_to_json(&self.headers),
        }))
    }
}

/// Parse a body as JSON, falling back to its text (or null when empty).
pub fn body_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

pub struct MutationEngine {
    sandbox: ScriptSandbox,
}

impl MutationEngine {
    pub fn new(limits: ScriptLimits) -> Self {
        Self {
            sandbox: ScriptSandbox::new(limits),
        }
    }

    pub fn sandbox(&self) -> &ScriptSandbox {
        &self.sandbox
    }

    /// Apply the route's pre-request list to the outgoing request.
    pub fn apply_pre(
        &self,
        request: RequestParts,
        route: &FlattenedRoute,
        ctx: &RequestContext,
    ) -> Mutated<RequestParts> {
        self.apply_list(request, &route.pre_mutations, route, ctx)
    }

    /// Apply the route's post-response list to the upstream response.
    pub fn apply_post(
        &self,
        response: ResponseParts,
        route: &FlattenedRoute,
        ctx: &RequestContext,
    ) -> Mutated<ResponseParts> {
        self.apply_list(response, &route.post_mutations, route, ctx)
    }

    fn apply_list<T: MutationTarget>(
        &self,
        mut target: T,
        mutations: &[Mutation],
        route: &FlattenedRoute,
        ctx: &RequestContext,
    ) -> Mutated<T> {
        let mut applied = 0;
        let mut scope: Option<Value> = None;

        for (index, mutation) in mutations.iter().enumerate() {
            let current_scope = scope.get_or_insert_with(|| {
                ctx.template_scope(body_value(target.body()), target.response_scope())
            });

            if let Some(cond) = &mutation.condition {
                let input = condition::ConditionInput {
                    context: ctx,
                    status: target.status(),
                    scope: current_scope,
                };
                if !condition::evaluate(cond, &input) {
                    tracing::debug!(
                        route_id = %route.id,
                        phase = T::PHASE,
                        index,
                        "Mutation skipped, condition not met"
                    );
                    continue;
                }
            }

            match self.apply_one(&mut target, &mutation.op, current_scope, ctx) {
                Ok(()) => {
                    applied += 1;
                    if matches!(mutation.op, MutationOp::Body(_) | MutationOp::Status(_)) {
                        scope = None;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        route_id = %route.id,
                        phase = T::PHASE,
                        index,
                        "Mutation failed and was skipped: {}",
                        e
                    );
                }
            }
        }

        Mutated {
            value: target,
            applied,
        }
    }

    fn apply_one<T: MutationTarget>(
        &self,
        target: &mut T,
        op: &MutationOp,
        scope: &Value,
        ctx: &RequestContext,
    ) -> Result<(), MutationError> {
        match op {
            MutationOp::Header(field) => apply_header(target.headers_mut(), field, scope),
            MutationOp::Query(field) => {
                let query = target
                    .query_mut()
                    .ok_or(MutationError::NotApplicable("query", T::PHASE))?;
                apply_query(query, field, scope);
                Ok(())
            }
            MutationOp::Body(transform) => {
                let (body, json_output) = self.transform_body(target.body(), transform, scope, ctx)?;
                if json_output {
                    target.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                }
                target.set_body(body);
                Ok(())
            }
            MutationOp::Status(status_op) => {
                let status = target
                    .status_mut()
                    .ok_or(MutationError::NotApplicable("status", T::PHASE))?;
                apply_status(status, status_op)
            }
        }
    }

    /// Returns the new body and whether it is JSON produced by the transform.
    fn transform_body(
        &self,
        body: &Bytes,
        transform: &BodyTransform,
        scope: &Value,
        ctx: &RequestContext,
    ) -> Result<(Bytes, bool), MutationError> {
        match transform {
            BodyTransform::JsonMap { mapping } => {
                let source: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
                let mut output = Value::Object(Map::new());
                for (from, to) in mapping {
                    if let Some(value) = path::lookup(&source, from) {
                        path::assign(&mut output, to, value.clone());
                    }
                }
                Ok((to_json_bytes(&output), true))
            }
            BodyTransform::JsonPath { path: expr, target } => {
                let source: Value =
                    serde_json::from_slice(body).map_err(|_| MutationError::NotJson)?;
                let selected = path::evaluate_json_path(&source, expr)?;
                let output = match target {
                    Some(target) => {
                        let mut wrapper = Value::Object(Map::new());
                        path::assign(&mut wrapper, target, selected);
                        wrapper
                    }
                    None => selected,
                };
                Ok((to_json_bytes(&output), true))
            }
            BodyTransform::Template { template: source } => {
                let rendered = template::render(source, scope).into_owned();
                Ok((Bytes::from(rendered), false))
            }
            BodyTransform::Function { code, timeout_ms } => {
                let input = ScriptInput {
                    body: body_value(body),
                    params: json!(ctx.params),
                    variables: json!(ctx.variables),
                    request: ctx.request_metadata(),
                };
                match self.sandbox.run(code, input, *timeout_ms)? {
                    Value::String(text) => Ok((Bytes::from(text), false)),
                    other => Ok((to_json_bytes(&other), true)),
                }
            }
        }
    }
}

fn to_json_bytes(value: &Value) -> Bytes {
    Bytes::from(value.to_string())
}

fn header_name(key: &str) -> Result<HeaderName, MutationError> {
    HeaderName::from_bytes(key.trim().as_bytes())
        .map_err(|_| MutationError::InvalidHeaderName(key.to_string()))
}

fn header_value(key: &str, value: &str) -> Result<HeaderValue, MutationError> {
    HeaderValue::from_str(value).map_err(|_| MutationError::InvalidHeaderValue(key.to_string()))
}

fn apply_header(headers: &mut HeaderMap, op: &FieldOp, scope: &Value) -> Result<(), MutationError> {
    match op {
        FieldOp::Add { key, value } => {
            let name = header_name(key)?;
            if !headers.contains_key(&name) {
                let value = header_value(key, &template::render(value, scope))?;
                headers.insert(name, value);
            }
        }
        FieldOp::Set { key, value } => {
            let name = header_name(key)?;
            let value = header_value(key, &template::render(value, scope))?;
            headers.insert(name, value);
        }
        FieldOp::Remove { key } => {
            headers.remove(header_name(key)?);
        }
        FieldOp::Rename { key, to } => {
            let from = header_name(key)?;
            let to = header_name(to)?;
            if from != to {
                let values: Vec<HeaderValue> = headers.get_all(&from).iter().cloned().collect();
                if !values.is_empty() {
                    headers.remove(&from);
                    headers.remove(&to);
                    for value in values {
                        headers.append(to.clone(), value);
                    }
                }
            }
        }
    }
    Ok(())
}

fn apply_query(query: &mut BTreeMap<String, String>, op: &FieldOp, scope: &Value) {
    match op {
        FieldOp::Add { key, value } => {
            if !query.contains_key(key) {
                query.insert(key.clone(), template::render(value, scope).into_owned());
            }
        }
        FieldOp::Set { key, value } => {
            query.insert(key.clone(), template::render(value, scope).into_owned());
        }
        FieldOp::Remove { key } => {
            query.remove(key);
        }
        FieldOp::Rename { key, to } => {
            if let Some(value) = query.remove(key) {
                query.insert(to.clone(), value);
            }
        }
    }
}

fn apply_status(status: &mut StatusCode, op: &StatusOp) -> Result<(), MutationError> {
    let replacement = match op {
        StatusOp::Override { code } => Some(*code),
        StatusOp::Map { mapping } => mapping.get(status.as_str()).copied(),
    };
    if let Some(code) = replacement {
        *status = StatusCode::from_u16(code).map_err(|_| MutationError::InvalidStatus(code))?;
    }
    Ok(())
}
