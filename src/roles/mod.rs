//! The three pipeline roles and the lifecycle they share.
//!
//! A role is user code implementing [`Ventilator`], [`Worker`] or [`Sink`];
//! the matching runner owns its sockets and drives it through
//! [`lifecycle::Lifecycle`].

pub mod lifecycle;
pub mod sink;
pub mod ventilator;
pub mod worker;

pub use lifecycle::{Lifecycle, LifecycleState, Phases, RunReport};
pub use sink::{Sink, SinkRunner};
pub use ventilator::{Ventilator, VentilatorRunner};
pub use worker::{Worker, WorkerRunner};

use crate::transport::EndpointSpec;

/// How the ventilator and sink agree that the sink is ready for results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// The ventilator pushes the marker straight into the sink's result
    /// channel and starts dispatching immediately. A worker result can in
    /// principle overtake the marker.
    #[default]
    Tolerant,
    /// The marker goes over a separate REQ/REP pair and the ventilator waits
    /// for the sink's acknowledgement before dispatching any work.
    Handshake { endpoint: EndpointSpec },
}

impl SyncMode {
    pub fn handshake(endpoint: impl Into<EndpointSpec>) -> Self {
        Self::Handshake {
            endpoint: endpoint.into(),
        }
    }
}
