//! Sandbox for tenant-authored `function` body transforms.
//!
//! Scripts are Rhai source evaluated by a fresh engine per call. The engine
//! has no filesystem, network or process access; it is bounded by operation,
//! size and call-depth limits, and a wall-clock deadline checked from the
//! progress hook terminates long-running scripts. `eval` is disabled and
//! `print`/`debug` output goes to `tracing` instead of stdout.
//!
//! The script sees four constants, `body`, `params`, `variables` and
//! `request`, and its final expression becomes the new body.
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;

use super::MutationError;
use crate::config::ScriptLimits;

/// Inputs exposed to a script.
#[derive(Debug, Clone)]
pub struct ScriptInput {
    pub body: Value,
    pub params: Value,
    pub variables: Value,
    pub request: Value,
}

#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    limits: ScriptLimits,
}

impl ScriptSandbox {
    pub fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ScriptLimits {
        &self.limits
    }

    fn engine(&self, deadline: Option<Instant>) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_expr_depths(64, 32);
        engine.disable_symbol("eval");

        engine.on_print(|text| tracing::debug!(target: "portico::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            tracing::debug!(
                target: "portico::script",
                source = source.unwrap_or("inline"),
                position = %pos,
                "{}",
                text
            )
        });

        if let Some(deadline) = deadline {
            engine.on_progress(move |_ops| {
                if Instant::now() >= deadline {
                    Some(Dynamic::UNIT)
                } else {
                    None
                }
            });
        }
        engine
    }

    /// Clamp a requested timeout to the configured bounds.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.limits.default_timeout_ms)
            .min(self.limits.max_timeout_ms)
            .max(1);
        Duration::from_millis(ms)
    }

    /// Syntax-check a script without running it.
    pub fn validate(&self, code: &str) -> Result<(), MutationError> {
        self.engine(None)
            .compile(code)
            .map(|_| ())
            .map_err(|e| MutationError::Script(e.to_string()))
    }

    pub fn run(
        &self,
        code: &str,
        input: ScriptInput,
        timeout_ms: Option<u64>,
    ) -> Result<Value, MutationError> {
        let timeout = self.effective_timeout(timeout_ms);
        let engine = self.engine(Some(Instant::now() + timeout));

        let mut scope = Scope::new();
        for (name, value) in [
            ("body", input.body),
            ("params", input.params),
            ("variables", input.variables),
            ("request", input.request),
        ] {
            let dynamic =
                rhai::serde::to_dynamic(value).map_err(|e| MutationError::Script(e.to_string()))?;
            scope.push_constant_dynamic(name, dynamic);
        }

        let result = engine
            .eval_with_scope::<Dynamic>(&mut scope, code)
            .map_err(|err| match *err {
                EvalAltResult::ErrorTerminated(..) => MutationError::ScriptTimeout(timeout),
                other => MutationError::Script(other.to_string()),
            })?;

        rhai::serde::from_dynamic::<Value>(&result).map_err(|e| MutationError::Script(e.to_string()))
    }
}
