//! Structured logging that works across process boundaries.
//!
//! - [`record`]: the [`LogRecord`] wire type and its severity scale
//! - [`logger`]: injectable [`Logger`] handles and in-process handlers
//! - [`monitor`]: pushing records to a supervisor and escalating failures

pub mod logger;
pub mod monitor;
pub mod record;

pub use logger::{Handler, Logger, MemoryHandler};
pub use monitor::{
    DEFAULT_LOG_PORT, Liveness, RelayHandler, configure_relay, monitor_and_relay, monitor_until,
};
pub use record::{Fields, LogRecord, ProcessType, Severity, format_key_values};
pub(crate) use record::fields;
