use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use serde_json::json;
use thiserror::Error;

use crate::core::{execution_log::Phase, flatten::ConfigError, mutation::ResponseParts};

/// Failures that end a request early. Each maps to one client-facing status.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Missing or invalid tenant in host")]
    InvalidTenant,

    #[error(transparent)]
    ConfigurationUnavailable(#[from] ConfigError),

    #[error("No gateway is configured for '{0}'")]
    TenantNotFound(String),

    #[error("No route matches {method} {path}")]
    NoRouteMatch {
        path: String,
        method: String,
        available_routes: usize,
    },

    #[error("Invalid path parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid destination '{destination}': {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("Upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("{} failed: {reason}", phase.as_str())]
    MutationFailed { phase: Phase, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::InvalidTenant | PipelineError::InvalidParameter { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::ConfigurationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::TenantNotFound(_) | PipelineError::NoRouteMatch { .. } => {
                StatusCode::NOT_FOUND
            }
            PipelineError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PipelineError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            PipelineError::InvalidDestination { .. }
            | PipelineError::MutationFailed { .. }
            | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidTenant => "invalid_tenant",
            PipelineError::ConfigurationUnavailable(_) => "configuration_unavailable",
            PipelineError::TenantNotFound(_) => "gateway_not_found",
            PipelineError::NoRouteMatch { .. } => "no_route_match",
            PipelineError::InvalidParameter { .. } => "invalid_parameter",
            PipelineError::PayloadTooLarge { .. } => "payload_too_large",
            PipelineError::InvalidDestination { .. } => "internal_error",
            PipelineError::UpstreamTimeout(_) => "upstream_timeout",
            PipelineError::UpstreamUnreachable(_) => "upstream_unreachable",
            PipelineError::MutationFailed { .. } | PipelineError::Internal(_) => "internal_error",
        }
    }

    /// Pipeline phase the error belongs to, for execution logs.
    pub fn phase(&self) -> Phase {
        match self {
            PipelineError::MutationFailed { phase, .. } => *phase,
            PipelineError::InvalidDestination { .. }
            | PipelineError::UpstreamTimeout(_)
            | PipelineError::UpstreamUnreachable(_)
            | PipelineError::Internal(_) => Phase::Proxy,
            _ => Phase::Routing,
        }
    }

    /// JSON error response. Internal failures carry no detail.
    pub fn to_response(&self) -> ResponseParts {
        let body = match self {
            PipelineError::NoRouteMatch {
                path,
                method,
                available_routes,
            } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "path": path,
                "method": method,
                "available_routes": available_routes,
            }),
            PipelineError::InvalidParameter { name, .. } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "parameter": name,
            }),
            PipelineError::ConfigurationUnavailable(_) => json!({
                "error": self.kind(),
                "message": "Gateway configuration is temporarily unavailable",
            }),
            PipelineError::InvalidDestination { .. }
            | PipelineError::MutationFailed { .. }
            | PipelineError::Internal(_) => json!({
                "error": self.kind(),
                "message": "Internal server error",
            }),
            _ => json!({
                "error": self.kind(),
                "message": self.to_string(),
            }),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        ResponseParts::new(self.status(), headers, Bytes::from(body.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::ports::document_store::StoreError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (PipelineError::InvalidTenant, 400),
            (
                PipelineError::ConfigurationUnavailable(ConfigError::Unavailable(
                    StoreError::Unavailable("down".into()),
                )),
                503,
            ),
            (PipelineError::TenantNotFound("x".into()), 404),
            (PipelineError::PayloadTooLarge { limit: 1 }, 413),
            (PipelineError::UpstreamTimeout(Duration::from_secs(1)), 504),
            (PipelineError::UpstreamUnreachable("refused".into()), 502),
            (PipelineError::Internal("boom".into()), 500),
        ];
        for (error, status) in cases {
            assert_eq!(error.status().as_u16(), status, "{error}");
        }
    }

    #[test]
    fn test_no_route_body_has_diagnostics() {
        let error = PipelineError::NoRouteMatch {
            path: "/nope".into(),
            method: "GET".into(),
            available_routes: 3,
        };
        let response = error.to_response();
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "no_route_match");
        assert_eq!(body["path"], "/nope");
        assert_eq!(body["available_routes"], 3);
    }

    #[test]
    fn test_mutation_failures_keep_their_phase() {
        let error = PipelineError::MutationFailed {
            phase: Phase::PostMutation,
            reason: "task panicked".into(),
        };
        assert_eq!(error.phase(), Phase::PostMutation);
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.to_string(), "post-mutation failed: task panicked");

        let body: Value = serde_json::from_slice(&error.to_response().body).unwrap();
        assert_eq!(body["error"], "internal_error");
        assert!(!body["message"].as_str().unwrap().contains("panicked"));
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let response = PipelineError::Internal("secret stack".into()).to_response();
        let text = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(!text.contains("secret"));
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
