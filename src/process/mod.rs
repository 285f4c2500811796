//! Process-level supervision of a pipeline.
//!
//! - [`manager`]: forks one process per role and supervises them
//! - [`proc`]: handle for a single role process
//! - [`signals`]: termination analysis

pub mod manager;
pub mod proc;
pub mod signals;

pub use manager::{DEFAULT_SINK_PORT, DEFAULT_VENTILATOR_PORT, LocalManager, ManagerConfig};
pub use proc::{DEFAULT_STOP_TIMEOUT, RoleProcess};
pub use signals::{TerminationReason, analyze_wait_status};
