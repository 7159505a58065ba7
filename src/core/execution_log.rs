//! Per-request execution records: phase timings, sanitized snapshots, errors.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;

use crate::{
    config::ExecutionLogConfig,
    core::{context::InboundRequest, entities::LogLevel, mutation::ResponseParts},
    ports::document_store::DocumentStore,
    utils::headers::sanitize_headers,
};

/// Appended to bodies cut at the size cap.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Routing,
    PreMutation,
    Proxy,
    PostMutation,
    Caching,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Routing => "routing",
            Phase::PreMutation => "pre-mutation",
            Phase::Proxy => "proxy",
            Phase::PostMutation => "post-mutation",
            Phase::Caching => "caching",
        }
    }
}

/// Milliseconds spent per phase. Routing and proxy are always reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub routing_ms: f64,
    pub proxy_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_mutation_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_mutation_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caching_ms: Option<f64>,
    pub total_ms: f64,
}

impl PhaseTimings {
    /// Add `elapsed` to a phase; repeated phases accumulate.
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        match phase {
            Phase::Routing => self.routing_ms += ms,
            Phase::Proxy => self.proxy_ms += ms,
            Phase::PreMutation => *self.pre_mutation_ms.get_or_insert(0.0) += ms,
            Phase::PostMutation => *self.post_mutation_ms.get_or_insert(0.0) += ms,
            Phase::Caching => *self.caching_ms.get_or_insert(0.0) += ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseError {
    pub phase: Phase,
    pub message: String,
}

/// What the pipeline learned while handling one request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTrace {
    pub route_id: Option<String>,
    pub route_name: Option<String>,
    pub cache_hit: bool,
    pub pre_mutations: usize,
    pub post_mutations: usize,
    pub timings: PhaseTimings,
    pub error: Option<PhaseError>,
}

impl ExecutionTrace {
    pub fn fail(&mut self, phase: Phase, message: impl Into<String>) {
        self.error = Some(PhaseError {
            phase,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub cache_hit: bool,
    pub pre_mutations: usize,
    pub post_mutations: usize,
    pub timings: PhaseTimings,
}

/// One persisted record per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub request_id: String,
    pub gateway_id: String,
    pub route_id: Option<String>,
    pub route_name: Option<String>,
    pub ip: Option<String>,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub execution: Execution,
    pub error: Option<PhaseError>,
    pub created_at: DateTime<Utc>,
    /// The store deletes the record after this instant.
    pub expires_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.status().is_none_or(|s| s >= 400)
    }
}

/// Cut `body` to at most `max` bytes of text, marking the cut.
pub fn truncate_body(body: &[u8], max: usize) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    if text.len() <= max {
        return Some(text.into_owned());
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&text[..end]);
    out.push_str(TRUNCATION_MARKER);
    Some(out)
}

/// Whether a gateway's log level keeps `record`.
pub fn should_persist(level: LogLevel, record: &LogRecord) -> bool {
    match level {
        LogLevel::None => false,
        LogLevel::Errors => record.is_error(),
        LogLevel::All => true,
    }
}

/// Builds log records and persists them in the background.
pub struct ExecutionLogger {
    store: Arc<dyn DocumentStore>,
    config: ExecutionLogConfig,
    tracker: TaskTracker,
}

impl ExecutionLogger {
    pub fn new(store: Arc<dyn DocumentStore>, config: ExecutionLogConfig, tracker: TaskTracker) -> Self {
        Self {
            store,
            config,
            tracker,
        }
    }

    pub fn build_record(
        &self,
        gateway_id: &str,
        ip: Option<String>,
        request: &InboundRequest,
        response: Option<&ResponseParts>,
        trace: ExecutionTrace,
    ) -> LogRecord {
        let max = self.config.max_body_bytes;
        let created_at = Utc::now();
        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or_else(|_| chrono::Duration::days(30));

        LogRecord {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request.request_id.clone(),
            gateway_id: gateway_id.to_string(),
            route_id: trace.route_id,
            route_name: trace.route_name,
            ip,
            request: RequestSnapshot {
                method: request.method.to_string(),
                path: request.path.clone(),
                query: request.query.clone(),
                headers: sanitize_headers(&request.headers),
                body: truncate_body(&request.body, max),
            },
            response: response.map(|r| ResponseSnapshot {
                status: r.status.as_u16(),
                headers: sanitize_headers(&r.headers),
                body: truncate_body(&r.body, max),
            }),
            execution: Execution {
                cache_hit: trace.cache_hit,
                pre_mutations: trace.pre_mutations,
                post_mutations: trace.post_mutations,
                timings: trace.timings,
            },
            error: trace.error,
            created_at,
            expires_at: created_at + retention,
        }
    }

    /// Persist in the background; failures are logged and otherwise ignored.
    pub fn persist(&self, record: LogRecord, level: LogLevel) {
        if !self.config.enabled || !should_persist(level, &record) {
            return;
        }
        let store = Arc::clone(&self.store);
        self.tracker.spawn(async move {
            let request_id = record.request_id.clone();
            if let Err(e) = store.insert_log(record).await {
                tracing::warn!(request_id = %request_id, "Failed to persist execution log: {}", e);
            }
        });
    }
}
