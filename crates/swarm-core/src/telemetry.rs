//! Trace span records and sinks

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

/// What a span describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Task,
    LlmCall,
    ToolCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
    Cancelled,
}

/// Generate a new trace or span identifier
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A finished (or in-flight) span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
}

impl SpanRecord {
    /// Open a span now, with a fresh span id
    pub fn start(
        trace_id: impl Into<String>,
        parent_span_id: Option<String>,
        kind: SpanKind,
        name: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: new_id(),
            parent_span_id,
            kind,
            name: name.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Close the span with `status`
    pub fn finish(mut self, status: SpanStatus) -> Self {
        self.ended_at = Some(Utc::now());
        self.status = status;
        self
    }

    pub fn duration_ms(&self) -> i64 {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}

/// Destination for finished spans
pub trait TraceSink: Send + Sync {
    fn emit(&self, span: SpanRecord);
}

/// Sink that writes spans to the `tracing` log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn emit(&self, span: SpanRecord) {
        info!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent_span_id = span.parent_span_id.as_deref().unwrap_or(""),
            kind = ?span.kind,
            status = ?span.status,
            duration_ms = span.duration_ms(),
            "span {}",
            span.name
        );
    }
}
