//! Injectable logger handles.
//!
//! A [`Logger`] fans records out to its [`Handler`]s and, while `propagate`
//! is set, re-emits them as `tracing` events so the process-wide subscriber
//! configured by [`crate::logging`] sees them too.

use super::record::{Fields, LogRecord, ProcessType, Severity, format_key_values};
use crate::error::Result;
use std::sync::{Arc, Mutex, MutexGuard};

/// Destination for log records.
pub trait Handler: Send {
    /// Consume one record.
    fn handle(&mut self, record: &LogRecord) -> Result<()>;

    /// Release any transport the handler holds. Later records may be
    /// rejected.
    fn close(&mut self) {}
}

struct LoggerInner {
    name: String,
    level: Severity,
    handlers: Vec<Box<dyn Handler>>,
    propagate: bool,
}

/// Cloneable logger handle. Clones share level, handlers and propagation.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Mutex<LoggerInner>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Logger")
            .field("name", &inner.name)
            .field("level", &inner.level)
            .field("handlers", &inner.handlers.len())
            .field("propagate", &inner.propagate)
            .finish()
    }
}

impl Logger {
    /// Create a logger with no handlers that propagates to `tracing`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoggerInner {
                name: name.into(),
                level: Severity::Trace,
                handlers: Vec::new(),
                propagate: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoggerInner> {
        // A panic inside a handler must not silence every later record.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Records below `level` are dropped by [`Logger::log`].
    pub fn set_level(&self, level: Severity) {
        self.lock().level = level;
    }

    pub fn set_propagate(&self, propagate: bool) {
        self.lock().propagate = propagate;
    }

    pub fn propagates(&self) -> bool {
        self.lock().propagate
    }

    pub fn add_handler(&self, handler: impl Handler + 'static) {
        self.lock().handlers.push(Box::new(handler));
    }

    /// Drop every handler and install `handler` as the only one.
    pub fn replace_handlers(&self, handler: impl Handler + 'static) {
        let mut inner = self.lock();
        inner.handlers.clear();
        inner.handlers.push(Box::new(handler));
    }

    /// Close every handler, releasing sockets they hold.
    pub fn close_handlers(&self) {
        for handler in self.lock().handlers.iter_mut() {
            handler.close();
        }
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    /// Whether a record at `level` would be emitted.
    pub fn enabled(&self, level: Severity) -> bool {
        level >= self.lock().level
    }

    /// Emit a record built from `level`, `message` and `fields`.
    pub fn log(&self, level: Severity, message: impl Into<String>, fields: Fields) {
        if !self.enabled(level) {
            return;
        }
        let record = LogRecord::new(level, self.name(), message).with_fields(fields);
        self.handle(record);
    }

    /// Emit a `PROCESS_TYPE(PID): STATUS k=v ...` record.
    ///
    /// `status` and `process_type` are also stored among the record fields so
    /// that handlers can match on them without parsing the message.
    pub fn log_keys_values(
        &self,
        level: Severity,
        status: &str,
        process_type: Option<ProcessType>,
        mut fields: Fields,
    ) {
        if !self.enabled(level) {
            return;
        }
        let pid = std::process::id();
        let message = format_key_values(status, process_type, pid, &fields);
        fields.insert("status".into(), status.into());
        let mut record = LogRecord::new(level, self.name(), message);
        if let Some(process_type) = process_type {
            fields.insert("process_type".into(), process_type.to_string().into());
            record = record.with_process_type(process_type);
        }
        self.handle(record.with_fields(fields));
    }

    /// Debug-level [`Logger::log_keys_values`].
    pub fn debug(&self, status: &str, process_type: Option<ProcessType>, fields: Fields) {
        self.log_keys_values(Severity::Debug, status, process_type, fields);
    }

    /// Dispatch an already-built record to every handler.
    ///
    /// The logger level is not applied here: relayed records were filtered by
    /// the logger that created them.
    pub fn handle(&self, record: LogRecord) {
        let mut inner = self.lock();
        for handler in inner.handlers.iter_mut() {
            if let Err(e) = handler.handle(&record) {
                tracing::warn!(logger = %record.logger, error = %e, "Log handler failed");
            }
        }
        if inner.propagate {
            emit_tracing(&record);
        }
    }
}

/// Forward a record to the process-wide `tracing` subscriber.
fn emit_tracing(record: &LogRecord) {
    let fields = serde_json::Value::Object(
        record
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let exc_text = record.exc_text.as_deref().unwrap_or("");
    let process_type = record
        .process_type
        .map(|p| p.to_string())
        .unwrap_or_default();

    macro_rules! emit {
        ($macro:ident $(, $extra:ident = $value:expr)?) => {
            tracing::$macro!(
                logger = %record.logger,
                process_type = %process_type,
                pid = record.pid,
                fields = %fields,
                exc_text = exc_text,
                $($extra = $value,)?
                "{}",
                record.message
            )
        };
    }

    match record.level {
        Severity::Trace => emit!(trace),
        Severity::Debug => emit!(debug),
        Severity::Info => emit!(info),
        Severity::Warning => emit!(warn),
        Severity::Error => emit!(error),
        Severity::Critical => emit!(error, critical = true),
    }
}

/// Handler that keeps every record in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryHandler {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records received so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statuses of the key/value records received so far, in order.
    pub fn statuses(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| r.status().map(String::from))
            .collect()
    }
}

impl Handler for MemoryHandler {
    fn handle(&mut self, record: &LogRecord) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}
