// Shared fixtures for the pipeline integration tests.
#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http::{HeaderMap, Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use portico::{
    AdminSync, MemoryDocumentStore, MemoryKvStore, Pipeline,
    config::ServerConfig,
    core::{
        context::{EnvInfo, InboundRequest},
        entities::StoreSeed,
        mutation::ResponseParts,
    },
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};
use serde_json::Value;
use tokio_util::task::TaskTracker;

/// What the mock upstream saw for one call.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
}

/// Canned upstream: answers every request with the same response and
/// remembers what it was sent.
pub struct MockUpstream {
    status: StatusCode,
    content_type: &'static str,
    body: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    seen: Mutex<Vec<SeenRequest>>,
}

impl MockUpstream {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            content_type: "application/json",
            body: body.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.seen.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl HttpClient for MockUpstream {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?
            .to_bytes();
        self.seen.lock().unwrap().push(SeenRequest {
            method: parts.method,
            uri: parts.uri.to_string(),
            headers: parts.headers,
            body,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut response = Response::new(AxumBody::from(self.body.clone()));
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, self.content_type.parse().unwrap());
        Ok(response)
    }
}

/// A pipeline wired to in-memory stores and a mock upstream.
pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryDocumentStore>,
    pub kv: Arc<MemoryKvStore>,
    pub upstream: Arc<MockUpstream>,
    pub admin: AdminSync,
}

impl Harness {
    pub async fn new(seed: Value, upstream: MockUpstream) -> Self {
        let seed: StoreSeed = serde_json::from_value(seed).unwrap();
        let config = ServerConfig::default();
        let store = Arc::new(MemoryDocumentStore::from_seed(seed).await);
        let kv = Arc::new(MemoryKvStore::new());
        let upstream = Arc::new(upstream);
        let pipeline = Arc::new(Pipeline::new(
            &config,
            store.clone(),
            kv.clone(),
            upstream.clone(),
            TaskTracker::new(),
        ));
        let admin = AdminSync::new(
            store.clone(),
            Arc::clone(pipeline.loader()),
            pipeline.cache().clone(),
        );
        Self {
            pipeline,
            store,
            kv,
            upstream,
            admin,
        }
    }

    pub async fn send(&self, subdomain: &str, request: InboundRequest) -> ResponseParts {
        let response = self
            .pipeline
            .handle(subdomain, request, EnvInfo::default())
            .await;
        self.settle().await;
        response
    }

    pub async fn get(&self, subdomain: &str, path: &str) -> ResponseParts {
        self.send(subdomain, InboundRequest::new(Method::GET, path))
            .await
    }

    /// Wait for cache writes, log records and stats updates spawned by the pipeline.
    pub async fn settle(&self) {
        let tracker = self.pipeline.tracker();
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }
}

pub fn json_body(response: &ResponseParts) -> Value {
    serde_json::from_slice(&response.body).unwrap()
}

pub fn header_value<'a>(response: &'a ResponseParts, name: &str) -> Option<&'a str> {
    response.headers.get(name).and_then(|v| v.to_str().ok())
}
