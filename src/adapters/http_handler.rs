use std::{net::SocketAddr, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use futures_util::FutureExt;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::json;
use tracing::Instrument;

use crate::{
    config::ServerConfig,
    core::{
        Pipeline,
        context::{EnvInfo, InboundRequest},
        error::PipelineError,
        mutation::ResponseParts,
        tenant::TenantResolver,
    },
    tracing_setup::create_request_span,
    utils::headers::parse_query,
};

/// Liveness endpoint answered by the gateway itself, on every host.
pub const HEALTH_PATH: &str = "/__portico/health";

/// HTTP handler: turns an axum request into a pipeline run for one tenant.
#[derive(Clone)]
pub struct HttpHandler {
    pipeline: Arc<Pipeline>,
    resolver: TenantResolver,
    max_body_bytes: usize,
    started: Instant,
}

impl HttpHandler {
    pub fn new(pipeline: Arc<Pipeline>, config: &ServerConfig) -> Self {
        let override_param = config
            .is_development()
            .then(|| config.tenant_override_param.clone());
        Self {
            pipeline,
            resolver: TenantResolver::new(override_param),
            max_body_bytes: config.max_request_body_bytes,
            started: Instant::now(),
        }
    }

    /// Axum router sending every path and method through [`HttpHandler::handle_request`].
    pub fn router(self) -> Router {
        Router::new()
            .fallback(
                |State(handler): State<Arc<HttpHandler>>, req: Request| async move {
                    let client_addr = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| *addr);
                    handler.handle_request(req, client_addr).await
                },
            )
            .with_state(Arc::new(self))
    }

    /// Main request handler. Never fails: every problem becomes a response.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        if req.uri().path() == HEALTH_PATH {
            return self.handle_health_check();
        }

        let received = Instant::now();
        let (parts, body) = req.into_parts();
        let mut query = parse_query(parts.uri.query());
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.host());

        let Some(subdomain) = self.resolver.resolve(host, &query) else {
            tracing::debug!(host = ?host, "Rejecting request without a valid tenant label");
            return into_response(PipelineError::InvalidTenant.to_response());
        };
        if let Some(param) = self.resolver.override_param() {
            query.remove(param);
        }

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

        let span = create_request_span(parts.method.as_str(), parts.uri.path(), &request_id);
        span.record("tenant", subdomain.as_str());

        let body = match self.read_body(&parts.headers, body).await {
            Ok(body) => body,
            Err(e) => {
                span.record("http.status_code", e.status().as_u16());
                return into_response(e.to_response());
            }
        };

        let env = EnvInfo::from_request(&parts.headers, client_addr);
        let inbound = InboundRequest {
            request_id,
            method: parts.method,
            path: parts.uri.path().to_string(),
            query,
            headers: parts.headers,
            body,
            received,
        };

        let run = self
            .pipeline
            .handle(&subdomain, inbound, env)
            .instrument(span.clone());
        let response = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(parent: &span, tenant = %subdomain, "Pipeline panicked: {}", message);
                PipelineError::Internal(message).to_response()
            }
        };

        span.record("http.status_code", response.status.as_u16());
        span.record(
            "duration_ms",
            received.elapsed().as_secs_f64() * 1000.0,
        );
        tracing::debug!(parent: &span, "Request completed");
        into_response(response)
    }

    /// Buffer the body, enforcing the configured size limit.
    async fn read_body(
        &self,
        headers: &axum::http::HeaderMap,
        body: AxumBody,
    ) -> Result<bytes::Bytes, PipelineError> {
        let limit = self.max_body_bytes;
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(PipelineError::PayloadTooLarge { limit });
        }

        match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(PipelineError::PayloadTooLarge { limit })
            }
            Err(e) => Err(PipelineError::Internal(format!("reading request body: {e}"))),
        }
    }

    fn handle_health_check(&self) -> Response<AxumBody> {
        let health_data = json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "pending_tasks": self.pipeline.tracker().len(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let mut response = Response::new(AxumBody::from(health_data.to_string()));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

fn into_response(parts: ResponseParts) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(parts.body));
    *response.status_mut() = parts.status;
    *response.headers_mut() = parts.headers;
    if response.status() == StatusCode::NO_CONTENT || response.status() == StatusCode::NOT_MODIFIED {
        response.headers_mut().remove(header::CONTENT_LENGTH);
    }
    response
}
