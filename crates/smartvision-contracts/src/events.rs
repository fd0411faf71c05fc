use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

/// One structured log record produced by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEvent {
    pub kind: String,
    pub level: LogLevel,
    pub message: String,
    pub batch_id: String,
    pub ts: String,
    pub fields: EventPayload,
}

impl PipelineEvent {
    /// Flattens the event into one JSON object.
    ///
    /// Default keys are `type`, `batch_id`, `ts`, `level` and `message`; caller fields are
    /// merged last and can override them.
    pub fn to_json(&self) -> Value {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(self.kind.clone()));
        event.insert("batch_id".to_string(), Value::String(self.batch_id.clone()));
        event.insert("ts".to_string(), Value::String(self.ts.clone()));
        event.insert(
            "level".to_string(),
            Value::String(self.level.as_str().to_string()),
        );
        event.insert("message".to_string(), Value::String(self.message.clone()));
        for (key, value) in &self.fields {
            event.insert(key.clone(), value.clone());
        }
        Value::Object(event)
    }
}

/// Destination for pipeline events. Implementations must not block on their consumers.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent) -> anyhow::Result<()>;
}

/// Append-only writer for an `events.jsonl` file, one compact JSON object per line.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl EventSink for EventWriter {
    fn emit(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event.to_json())?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// Hands events to another thread over an unbounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Sender<PipelineEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<PipelineEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| anyhow::anyhow!("channel sink lock poisoned"))?;
        sender
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver disconnected"))
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.kind)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("recording sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Broadcasts to every inner sink; a failing sink does not stop the others.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(event) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &PipelineEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Cheap handle that components use to report what they are doing.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
    batch_id: String,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>, batch_id: impl Into<String>) -> Self {
        Self {
            sink,
            batch_id: batch_id.into(),
        }
    }

    pub fn null() -> Self {
        Self::new(Arc::new(NullSink), "")
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn log(
        &self,
        level: LogLevel,
        kind: &str,
        message: impl Into<String>,
        fields: EventPayload,
    ) {
        let event = PipelineEvent {
            kind: kind.to_string(),
            level,
            message: message.into(),
            batch_id: self.batch_id.clone(),
            ts: now_utc_iso(),
            fields,
        };
        // A broken sink must never change the outcome of a batch.
        let _ = self.sink.emit(&event);
    }

    pub fn debug(&self, kind: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, kind, message, EventPayload::new());
    }

    pub fn info(&self, kind: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, kind, message, EventPayload::new());
    }

    pub fn warning(&self, kind: &str, message: impl Into<String>) {
        self.log(LogLevel::Warning, kind, message, EventPayload::new());
    }

    pub fn error(&self, kind: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, kind, message, EventPayload::new());
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
