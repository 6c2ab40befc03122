//! obscore-logger
//!
//! Produces structured `LogRecord`s: pulls the ambient `TraceContext` from
//! `obscore-context`, runs the merged metadata through `obscore-sanitizer`,
//! and hands the record to a pluggable sink. See `SPEC_FULL.md` §4.3.

mod sink;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use obscore_sanitizer::Sanitizer;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

pub use sink::{RollingFileSink, Sink, StdoutSink};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("policy violation: metadata contains PII while strict_mode is enabled")]
    PolicyViolation { metadata: Json },
}

/// Log level, ordered least to most severe matching the spec's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Verbose,
    Debug,
    Http,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Http => "http",
            Level::Debug => "debug",
            Level::Verbose => "verbose",
        }
    }
}

/// One structured record, handed once to a [`Sink`] and never retained.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Json>,
}

/// Produces `LogRecord`s against a fixed `Sanitizer` and `Sink`.
///
/// `with_context` returns a child whose emits default to a context label,
/// mirroring the teacher's builder-style construction (`with_*` methods
/// returning `Self`) without mutating the parent.
pub struct Logger {
    sanitizer: Arc<Sanitizer>,
    sink: Box<dyn Sink>,
    strict_mode: bool,
    context_label: Option<String>,
}

impl Logger {
    pub fn new(sanitizer: Sanitizer, sink: Box<dyn Sink>) -> Self {
        Self { sanitizer: Arc::new(sanitizer), sink, strict_mode: false, context_label: None }
    }

    pub fn with_strict_mode(mut self, strict_mode: bool) -> Self {
        self.strict_mode = strict_mode;
        self
    }

    /// A child logger sharing this one's sanitizer and sink, with a default
    /// context label attached to every emit that doesn't override it.
    pub fn with_context(&self, name: impl Into<String>) -> Self {
        Self {
            sanitizer: self.sanitizer.clone(),
            sink: self.sink.clone_box(),
            strict_mode: self.strict_mode,
            context_label: Some(name.into()),
        }
    }

    fn build_metadata(&self, user_metadata: Json) -> Result<Json, LogError> {
        let trace = obscore_context::current();
        let mut merged = serde_json::Map::new();
        for (k, v) in trace.iter() {
            merged.insert(k.to_string(), Json::String(v.to_string()));
        }
        if let Json::Object(user_map) = user_metadata {
            for (k, v) in user_map {
                merged.insert(k, v);
            }
        }
        let merged = Json::Object(merged);
        if self.strict_mode && self.sanitizer.contains_pii_json(&merged) {
            return Err(LogError::PolicyViolation { metadata: merged });
        }
        Ok(self.sanitizer.sanitize_json(&merged))
    }

    /// Core emit operation. `context` overrides this logger's default
    /// context label for this one record.
    pub fn emit(
        &self,
        level: Level,
        message: impl Into<String>,
        metadata: Option<Json>,
        context: Option<&str>,
    ) -> Result<(), LogError> {
        let metadata = self.build_metadata(metadata.unwrap_or(Json::Object(Default::default())))?;
        let trace = obscore_context::current();
        let trace_map = if trace.is_empty() { None } else { Some(trace.into_map()) };
        let record = LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.as_str(),
            message: message.into(),
            context: context.map(str::to_string).or_else(|| self.context_label.clone()),
            trace: trace_map,
            metadata: if matches!(&metadata, Json::Object(m) if m.is_empty()) { None } else { Some(metadata) },
        };
        if let Err(err) = self.sink.accept(&record) {
            eprintln!("[obscore] sink error, falling back to stderr: {err}");
            eprintln!("{}", serde_json::to_string(&record).unwrap_or_default());
        }
        Ok(())
    }

    pub fn error(&self, message: impl Into<String>, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Error, message, metadata, None)
    }
    pub fn warn(&self, message: impl Into<String>, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Warn, message, metadata, None)
    }
    pub fn info(&self, message: impl Into<String>, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, message, metadata, None)
    }
    pub fn http(&self, message: impl Into<String>, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Http, message, metadata, None)
    }
    pub fn debug(&self, message: impl Into<String>, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Debug, message, metadata, None)
    }
    pub fn verbose(&self, message: impl Into<String>, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Verbose, message, metadata, None)
    }

    // -- specialized emitters: syntactic sugar composing a canonical message
    // prefix and metadata sub-object, per §4.3. Severity mapping is fixed.

    pub fn step_begin(&self, step: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, format!("[step:begin] {step}"), metadata, None)
    }

    pub fn step_progress(&self, step: &str, pct: f64, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, format!("[step:progress] {step} ({pct:.0}%)"), metadata, None)
    }

    pub fn step_complete(&self, step: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, format!("[step:complete] {step}"), metadata, None)
    }

    pub fn step_failed(&self, step: &str, reason: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Error, format!("[step:failed] {step}: {reason}"), metadata, None)
    }

    pub fn http_request(&self, method: &str, path: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Http, format!("{method} {path}"), metadata, None)
    }

    /// 5xx -> error, 4xx -> warn, else http.
    pub fn http_response(
        &self,
        method: &str,
        path: &str,
        status: u16,
        duration_ms: u64,
        metadata: Option<Json>,
    ) -> Result<(), LogError> {
        let level = if status >= 500 {
            Level::Error
        } else if status >= 400 {
            Level::Warn
        } else {
            Level::Http
        };
        let message = format!("{method} {path} {status} {duration_ms}ms");
        self.emit(level, message, with_field(metadata, "status_code", Json::from(status)), None)
    }

    /// Final attempt -> error, else warn.
    pub fn retry(&self, operation: &str, attempt: u32, max_attempts: u32, metadata: Option<Json>) -> Result<(), LogError> {
        let level = if attempt >= max_attempts { Level::Error } else { Level::Warn };
        let message = format!("[retry] {operation} attempt {attempt}/{max_attempts}");
        self.emit(level, message, metadata, None)
    }

    pub fn exception(&self, message: &str, stack: Option<&str>, metadata: Option<Json>) -> Result<(), LogError> {
        let metadata = match stack {
            Some(s) => with_field(metadata, "stack", Json::String(s.to_string())),
            None => metadata,
        };
        self.emit(Level::Error, format!("[exception] {message}"), metadata, None)
    }

    pub fn webhook_in(&self, source: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, format!("[webhook:in] {source}"), metadata, None)
    }

    pub fn webhook_out(&self, target: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, format!("[webhook:out] {target}"), metadata, None)
    }

    /// error/disconnect -> error or warn per `event`, else info.
    pub fn websocket_event(&self, event: &str, metadata: Option<Json>) -> Result<(), LogError> {
        let level = match event {
            "error" => Level::Error,
            "disconnect" => Level::Warn,
            _ => Level::Info,
        };
        self.emit(level, format!("[websocket] {event}"), metadata, None)
    }

    /// >= 1s -> warn, else debug.
    pub fn database_op(&self, operation: &str, duration_ms: u64, metadata: Option<Json>) -> Result<(), LogError> {
        let level = if duration_ms >= 1000 { Level::Warn } else { Level::Debug };
        let message = format!("[db] {operation} {duration_ms}ms");
        self.emit(level, message, with_field(metadata, "duration_ms", Json::from(duration_ms)), None)
    }

    pub fn cache_op(&self, operation: &str, hit: bool, metadata: Option<Json>) -> Result<(), LogError> {
        let message = format!("[cache] {operation} {}", if hit { "hit" } else { "miss" });
        self.emit(Level::Debug, message, metadata, None)
    }

    pub fn queue_op(&self, operation: &str, queue: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Debug, format!("[queue:{queue}] {operation}"), metadata, None)
    }

    pub fn external_api(&self, service: &str, operation: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Info, format!("[external:{service}] {operation}"), metadata, None)
    }

    pub fn auth_event(&self, event: &str, success: bool, metadata: Option<Json>) -> Result<(), LogError> {
        let level = if success { Level::Info } else { Level::Warn };
        self.emit(level, format!("[auth] {event}"), metadata, None)
    }

    pub fn file_op(&self, operation: &str, path: &str, metadata: Option<Json>) -> Result<(), LogError> {
        self.emit(Level::Debug, format!("[file] {operation} {path}"), metadata, None)
    }

    pub fn payment(&self, operation: &str, success: bool, metadata: Option<Json>) -> Result<(), LogError> {
        let level = if success { Level::Info } else { Level::Error };
        self.emit(level, format!("[payment] {operation}"), metadata, None)
    }
}

fn with_field(metadata: Option<Json>, key: &str, value: Json) -> Option<Json> {
    let mut map = match metadata {
        Some(Json::Object(m)) => m,
        _ => serde_json::Map::new(),
    };
    map.insert(key.to_string(), value);
    Some(Json::Object(map))
}
