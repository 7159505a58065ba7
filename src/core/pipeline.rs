//! Request pipeline: routing, pre-mutation, upstream call, post-mutation, caching.
//!
//! Stages run strictly in sequence for one request. Cache population, log
//! persistence and stats updates are spawned on a shared [`TaskTracker`] so
//! they never delay the response; the binary waits on the tracker at
//! shutdown so that spawned work gets a chance to finish.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::body::Body as AxumBody;
use chrono::Utc;
use http::{HeaderName, HeaderValue, Request, header};
use http_body_util::BodyExt;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use url::Url;

use crate::{
    config::ServerConfig,
    core::{
        cache::{CACHE_STATUS_HEADER, ResponseCache, generate_key, should_cache},
        context::{ContextBuilder, EnvInfo, InboundRequest, RequestContext},
        destination::build_destination,
        entities::RequestStats,
        error::PipelineError,
        execution_log::{ExecutionLogger, ExecutionTrace, Phase},
        flatten::{ConfigLoader, FlattenedGateway, FlattenedRoute},
        mutation::{Mutated, MutationEngine, RequestParts, ResponseParts, ScriptSandbox},
        router::match_route,
    },
    ports::{
        document_store::DocumentStore,
        http_client::{HttpClient, HttpClientError},
        kv_store::KeyValueStore,
    },
    tracing_setup::create_upstream_span,
    utils::headers::strip_hop_by_hop,
};

pub const GATEWAY_ID_HEADER: &str = "x-gateway-id";
pub const ROUTE_NAME_HEADER: &str = "x-route-name";

pub struct Pipeline {
    loader: Arc<ConfigLoader>,
    cache: ResponseCache,
    engine: Arc<MutationEngine>,
    client: Arc<dyn HttpClient>,
    store: Arc<dyn DocumentStore>,
    logger: ExecutionLogger,
    tracker: TaskTracker,
    default_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn DocumentStore>,
        kv: Arc<dyn KeyValueStore>,
        client: Arc<dyn HttpClient>,
        tracker: TaskTracker,
    ) -> Self {
        let loader = ConfigLoader::new(
            Arc::clone(&store),
            Arc::clone(&kv),
            config.config_cache_ttl(),
            ScriptSandbox::new(config.script.clone()),
        );
        Self {
            loader: Arc::new(loader),
            cache: ResponseCache::new(kv),
            engine: Arc::new(MutationEngine::new(config.script.clone())),
            client,
            logger: ExecutionLogger::new(
                Arc::clone(&store),
                config.execution_log.clone(),
                tracker.clone(),
            ),
            store,
            tracker,
            default_timeout: config.upstream_timeout(),
        }
    }

    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Run one request for `subdomain`. Every failure becomes an error response.
    pub async fn handle(&self, subdomain: &str, request: InboundRequest, env: EnvInfo) -> ResponseParts {
        let snapshot = match self.loader.load(subdomain).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::debug!(subdomain, "No active gateway for subdomain");
                return PipelineError::TenantNotFound(subdomain.to_string()).to_response();
            }
            Err(e) => {
                tracing::error!(subdomain, "Failed to load gateway configuration: {}", e);
                return PipelineError::from(e).to_response();
            }
        };

        let ip = env.ip.clone();
        let mut trace = ExecutionTrace::default();
        let mut response = match self.execute(&snapshot, &request, env, &mut trace).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    PipelineError::Internal(_)
                    | PipelineError::MutationFailed { .. }
                    | PipelineError::InvalidDestination { .. } => {
                        tracing::error!(gateway_id = %snapshot.id, "Request failed: {}", e)
                    }
                    _ => tracing::info!(gateway_id = %snapshot.id, "Request rejected: {}", e),
                }
                trace.fail(e.phase(), e.to_string());
                e.to_response()
            }
        };

        decorate(&mut response, &snapshot, &trace);
        trace.timings.total_ms = request.received.elapsed().as_secs_f64() * 1000.0;
        self.finish(&snapshot, ip, &request, &response, trace);
        response
    }

    async fn execute(
        &self,
        snapshot: &Arc<FlattenedGateway>,
        request: &InboundRequest,
        env: EnvInfo,
        trace: &mut ExecutionTrace,
    ) -> Result<ResponseParts, PipelineError> {
        let started = Instant::now();
        let matched = match_route(&request.path, &request.method, &snapshot.routes);
        trace.timings.record(Phase::Routing, started.elapsed());
        let Some(matched) = matched else {
            return Err(PipelineError::NoRouteMatch {
                path: request.path.clone(),
                method: request.method.to_string(),
                available_routes: snapshot.routes.len(),
            });
        };
        let route = matched.route;
        let index = matched.index;
        trace.route_id = Some(route.id.clone());
        trace.route_name = Some(route.name.clone());
        tracing::Span::current().record("route.id", route.id.as_str());

        for (name, rule) in &route.validation {
            if let Some(value) = matched.params.get(name) {
                rule.check(value)
                    .map_err(|reason| PipelineError::InvalidParameter {
                        name: name.clone(),
                        reason,
                    })?;
            }
        }

        let ctx = Arc::new(ContextBuilder::build(request, snapshot, env, matched.params));

        let cache_key = route
            .cache
            .as_ref()
            .map(|policy| generate_key(route, policy, &ctx));
        if let Some(key) = &cache_key {
            let started = Instant::now();
            let lookup = self.cache.get(key).await;
            trace.timings.record(Phase::Caching, started.elapsed());
            match lookup {
                Ok(Some(hit)) => {
                    tracing::debug!(route_id = %route.id, "Cache hit");
                    trace.cache_hit = true;
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(route_id = %route.id, "Cache lookup failed: {}", e),
            }
        }

        let started = Instant::now();
        let outgoing = RequestParts {
            method: request.method.clone(),
            headers: request.headers.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
        };
        let outgoing = self
            .run_mutations(
                snapshot,
                index,
                &ctx,
                outgoing,
                Phase::PreMutation,
                MutationEngine::apply_pre,
            )
            .await?;
        if !route.pre_mutations.is_empty() {
            trace.timings.record(Phase::PreMutation, started.elapsed());
        }
        trace.pre_mutations = outgoing.applied;
        let outgoing = outgoing.value;

        let url = build_destination(snapshot, route, &ctx, &outgoing.query)?;
        let timeout = route
            .timeout_ms
            .or(snapshot.defaults.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let started = Instant::now();
        let upstream = self.forward(url, outgoing, request, &ctx, timeout).await;
        trace.timings.record(Phase::Proxy, started.elapsed());
        let upstream = upstream?;

        let started = Instant::now();
        let mutated = self
            .run_mutations(
                snapshot,
                index,
                &ctx,
                upstream,
                Phase::PostMutation,
                MutationEngine::apply_post,
            )
            .await?;
        if !route.post_mutations.is_empty() {
            trace.timings.record(Phase::PostMutation, started.elapsed());
        }
        trace.post_mutations = mutated.applied;
        let mut response = mutated.value;
        response.headers.remove(header::CONTENT_LENGTH);

        if let (Some(policy), Some(key)) = (&route.cache, cache_key) {
            let started = Instant::now();
            if should_cache(&response, policy) {
                let cache = self.cache.clone();
                let stored = response.clone();
                let route_id = route.id.clone();
                let policy = policy.clone();
                self.tracker.spawn(async move {
                    if let Err(e) = cache.set(&key, &stored, &route_id, &policy).await {
                        tracing::warn!(route_id = %route_id, "Failed to store cached response: {}", e);
                    }
                });
            }
            trace.timings.record(Phase::Caching, started.elapsed());
        }

        Ok(response)
    }

    /// Apply one mutation phase. Routes with scripts run on the blocking pool
    /// because a script may spin until its deadline.
    async fn run_mutations<T, F>(
        &self,
        snapshot: &Arc<FlattenedGateway>,
        index: usize,
        ctx: &Arc<RequestContext>,
        value: T,
        phase: Phase,
        apply: F,
    ) -> Result<Mutated<T>, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&MutationEngine, T, &FlattenedRoute, &RequestContext) -> Mutated<T>
            + Send
            + 'static,
    {
        let route = &snapshot.routes[index];
        if !route.has_scripts() {
            return Ok(apply(self.engine.as_ref(), value, route, ctx.as_ref()));
        }

        let engine = Arc::clone(&self.engine);
        let snapshot = Arc::clone(snapshot);
        let ctx = Arc::clone(ctx);
        tokio::task::spawn_blocking(move || {
            apply(engine.as_ref(), value, &snapshot.routes[index], ctx.as_ref())
        })
        .await
        .map_err(|e| PipelineError::MutationFailed {
            phase,
            reason: e.to_string(),
        })
    }

    async fn forward(
        &self,
        url: Url,
        outgoing: RequestParts,
        inbound: &InboundRequest,
        ctx: &RequestContext,
        timeout: Duration,
    ) -> Result<ResponseParts, PipelineError> {
        let mut headers = outgoing.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        if let Some(host) = inbound.headers.get(header::HOST) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        }
        if let Some(ip) = &ctx.ip {
            let forwarded = match inbound
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(existing) if !existing.contains(ip.as_str()) => format!("{existing}, {ip}"),
                Some(existing) => existing.to_string(),
                None => ip.clone(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }
        if !headers.contains_key("x-forwarded-proto") {
            headers.insert(
                HeaderName::from_static("x-forwarded-proto"),
                HeaderValue::from_static("http"),
            );
        }
        if let Ok(value) = HeaderValue::from_str(&inbound.request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }
        if !outgoing.body.is_empty() {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(outgoing.body.len()));
        }

        let method = outgoing.method;
        let mut req = Request::new(AxumBody::from(outgoing.body));
        *req.method_mut() = method.clone();
        *req.uri_mut() = url
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| PipelineError::InvalidDestination {
                destination: url.to_string(),
                reason: e.to_string(),
            })?;
        *req.headers_mut() = headers;

        let span = create_upstream_span(url.as_str(), method.as_str());
        let client = Arc::clone(&self.client);
        let call = async move {
            let response = client.send_request(req).await?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| HttpClientError::ConnectionError(format!("reading body: {e}")))?
                .to_bytes();
            Ok::<_, HttpClientError>((parts, body))
        };

        match tokio::time::timeout(timeout, call.instrument(span.clone())).await {
            Err(_) | Ok(Err(HttpClientError::Timeout(_))) => {
                tracing::warn!(upstream = %url, ?timeout, "Upstream timed out");
                Err(PipelineError::UpstreamTimeout(timeout))
            }
            Ok(Err(e)) => Err(PipelineError::UpstreamUnreachable(e.to_string())),
            Ok(Ok((parts, body))) => {
                span.record("http.status_code", parts.status.as_u16());
                let mut headers = parts.headers;
                strip_hop_by_hop(&mut headers);
                Ok(ResponseParts::new(parts.status, headers, body))
            }
        }
    }

    /// Hand the execution log and stats update to the background tracker.
    fn finish(
        &self,
        snapshot: &FlattenedGateway,
        ip: Option<String>,
        request: &InboundRequest,
        response: &ResponseParts,
        trace: ExecutionTrace,
    ) {
        let stats = RequestStats {
            gateway_id: snapshot.id.clone(),
            route_id: trace.route_id.clone(),
            status: response.status.as_u16(),
            duration_ms: trace.timings.total_ms.round() as u64,
            cache_hit: trace.cache_hit,
            at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        self.tracker.spawn(async move {
            if let Err(e) = store.record_request(stats).await {
                tracing::debug!("Failed to record request stats: {}", e);
            }
        });

        let record = self
            .logger
            .build_record(&snapshot.id, ip, request, Some(response), trace);
        self.logger.persist(record, snapshot.defaults.log_level);
    }
}

fn decorate(response: &mut ResponseParts, snapshot: &FlattenedGateway, trace: &ExecutionTrace) {
    let headers = &mut response.headers;
    if let Ok(value) = HeaderValue::from_str(&snapshot.id) {
        headers.insert(HeaderName::from_static(GATEWAY_ID_HEADER), value);
    }
    if let Some(name) = &trace.route_name {
        if let Ok(value) = HeaderValue::from_str(name) {
            headers.insert(HeaderName::from_static(ROUTE_NAME_HEADER), value);
        }
        let status = if trace.cache_hit { "HIT" } else { "MISS" };
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static(status),
        );
    }
}
