//! Structured log records that can cross process boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Auxiliary key/value fields attached to a record, kept sorted by key.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Build [`Fields`] from `key => value` pairs.
macro_rules! fields {
    () => {
        $crate::relay::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::relay::Fields::new();
        $(fields.insert(String::from($key), ::serde_json::Value::from($value));)+
        fields
    }};
}
pub(crate) use fields;

/// Severity of a log record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            _ => Err(format!(
                "Unknown severity: '{}'. Valid options: trace, debug, info, warning, error, critical",
                s
            )),
        }
    }
}

/// Which role a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessType {
    Ventilator,
    Worker,
    Sink,
    Manager,
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ventilator => "VENTILATOR",
            Self::Worker => "WORKER",
            Self::Sink => "SINK",
            Self::Manager => "MANAGER",
        };
        f.write_str(name)
    }
}

/// A single log event.
///
/// Exceptions are carried only as rendered text in `exc_text`; nothing in a
/// record refers back to live state of the process that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: Severity,
    pub message: String,
    /// Name of the logger that produced the record.
    pub logger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_type: Option<ProcessType>,
    pub pid: u32,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_text: Option<String>,
}

impl LogRecord {
    /// Create a record stamped with the current pid and time.
    pub fn new(level: Severity, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            logger: logger.into(),
            process_type: None,
            pid: std::process::id(),
            created: Utc::now(),
            fields: Fields::new(),
            exc_text: None,
        }
    }

    pub fn with_process_type(mut self, process_type: ProcessType) -> Self {
        self.process_type = Some(process_type);
        self
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_exc_text(mut self, text: impl Into<String>) -> Self {
        self.exc_text = Some(text.into());
        self
    }

    /// `PROCESS_TYPE(PID)` if the process type is known, else `pid PID`.
    pub fn origin(&self) -> String {
        match self.process_type {
            Some(process_type) => format!("{}({})", process_type, self.pid),
            None => format!("pid {}", self.pid),
        }
    }

    /// The `status` field set by key/value debug records, if any.
    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(|v| v.as_str())
    }

    /// Encode as a single JSON wire payload.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from a JSON wire payload.
    pub fn from_bytes(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Render a status message in `PROCESS_TYPE(PID): STATUS k1=v1 k2=v2` form.
///
/// Keys come out sorted. String values are printed without quotes.
pub fn format_key_values(
    status: &str,
    process_type: Option<ProcessType>,
    pid: u32,
    fields: &Fields,
) -> String {
    let mut message = match process_type {
        Some(process_type) => format!("{}({}): {} ", process_type, pid, status),
        None => format!("{} ", status),
    };
    let pairs: Vec<String> = fields
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect();
    message.push_str(&pairs.join(" "));
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Trace < Severity::Debug);
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_severity_from_str() {
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("WARN".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn test_format_key_values_with_process_type() {
        let mut fields = Fields::new();
        fields.insert("port".into(), json!(5557));
        fields.insert("address".into(), json!("tcp://localhost:5558"));

        let message = format_key_values("BOUND_SENDER", Some(ProcessType::Ventilator), 42, &fields);
        assert_eq!(
            message,
            "VENTILATOR(42): BOUND_SENDER address=tcp://localhost:5558 port=5557"
        );
    }

    #[test]
    fn test_format_key_values_without_process_type() {
        let message = format_key_values("SETUP", None, 42, &Fields::new());
        assert_eq!(message, "SETUP ");
    }

    #[test]
    fn test_record_wire_format() {
        let record = LogRecord::new(Severity::Error, "taskvent::test", "boom")
            .with_process_type(ProcessType::Worker)
            .with_field("batch", 7)
            .with_exc_text("caused by: disk full");

        let payload = record.to_bytes().unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        assert!(text.contains("\"level\":\"ERROR\""));
        assert!(text.contains("\"process_type\":\"WORKER\""));

        let decoded = LogRecord::from_bytes(&payload).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.origin(), format!("WORKER({})", std::process::id()));
    }

    #[test]
    fn test_record_optional_fields_omitted() {
        let record = LogRecord::new(Severity::Info, "taskvent::test", "plain");
        let text = String::from_utf8(record.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("exc_text"));
        assert!(!text.contains("fields"));
        assert!(record.status().is_none());
    }
}
