//! taskvent - divide-and-conquer task distribution over ZeroMQ.
//!
//! A ventilator partitions work and pushes it to a pool of workers; each
//! worker turns an item into zero or more results and pushes them to a sink,
//! which aggregates until it is done. Every role runs in its own process and
//! may relay its log records to a supervising process, which treats records
//! above a severity threshold as a failure of the whole pipeline.
//!
//! - [`transport`]: endpoint resolution, EINTR-safe calls, payload helpers
//! - [`roles`]: the [`roles::Ventilator`], [`roles::Worker`] and
//!   [`roles::Sink`] traits and their runners
//! - [`process`]: forking and supervising role processes
//! - [`relay`]: structured log records and the cross-process relay
//! - [`squares`]: a sum-of-squares reference pipeline

pub mod error;
pub mod logging;
pub mod process;
pub mod relay;
pub mod roles;
pub mod squares;
pub mod transport;

pub use error::{Result, TaskventError};
