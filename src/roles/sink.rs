//! The sink role: collects results until its completion condition holds.

use super::SyncMode;
use super::lifecycle::{Lifecycle, LifecycleState, Phases, RunReport};
use crate::error::{Result, TaskventError};
use crate::relay::{Logger, ProcessType, fields};
use crate::transport::message::describe_payload;
use crate::transport::{
    BIND_ANY, DEFAULT_MAX_RETRIES, EndpointSpec, SYNC_ACK, SYNC_MARKER, apply_hwm, bind_endpoint,
    recv_bytes, send_bytes,
};

/// Aggregation stage of a pipeline.
pub trait Sink: Phases {
    type Item;

    /// Receive and decode one result.
    fn recv(&mut self, socket: &zmq::Socket) -> Result<Self::Item>;

    /// Fold one result into the aggregate.
    fn process(&mut self, item: Self::Item) -> Result<()>;

    /// Checked before every result; by default the sink never finishes.
    fn done(&self) -> bool {
        false
    }
}

struct SinkSockets {
    receiver: zmq::Socket,
    handshake: Option<zmq::Socket>,
}

/// Owns a [`Sink`] and its sockets and runs it through its lifecycle.
pub struct SinkRunner<S: Sink> {
    role: S,
    lifecycle: Lifecycle,
    sync: SyncMode,
    sockets: Option<SinkSockets>,
    port: Option<u16>,
}

impl<S: Sink> SinkRunner<S> {
    pub fn new(role: S, logger: Logger) -> Self {
        Self {
            role,
            lifecycle: Lifecycle::new(ProcessType::Sink, logger),
            sync: SyncMode::Tolerant,
            sockets: None,
            port: None,
        }
    }

    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Bind the results channel (and the handshake socket, if enabled).
    /// Returns the bound results port.
    pub fn initialize_sockets(
        &mut self,
        context: zmq::Context,
        receiver: &EndpointSpec,
        receiver_hwm: Option<i32>,
    ) -> Result<u16> {
        self.lifecycle.ensure_uninitialized()?;

        let receiver_socket = context.socket(zmq::PULL)?;
        apply_hwm(&receiver_socket, receiver_hwm)?;
        let port = bind_endpoint(&receiver_socket, receiver, BIND_ANY, DEFAULT_MAX_RETRIES)?;
        self.lifecycle.debug(
            "LISTENING",
            fields! { "port" => port, "hwm" => receiver_hwm },
        );

        let handshake = match &self.sync {
            SyncMode::Tolerant => None,
            SyncMode::Handshake { endpoint } => {
                let socket = context.socket(zmq::REP)?;
                let port = bind_endpoint(&socket, endpoint, BIND_ANY, DEFAULT_MAX_RETRIES)?;
                self.lifecycle
                    .debug("LISTENING_HANDSHAKE", fields! { "port" => port });
                Some(socket)
            }
        };

        self.sockets = Some(SinkSockets {
            receiver: receiver_socket,
            handshake,
        });
        self.port = Some(port);
        self.lifecycle.sockets_initialized(context)?;
        Ok(port)
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Wait for the ventilator's marker, then process results until `done`.
    pub fn run(self) -> RunReport {
        let logger = self.lifecycle.logger().clone();
        self.lifecycle
            .run(self.role, self.sockets, move |role, sockets| {
                await_marker(sockets)?;
                logger.debug("RECEIVED_MARKER", Some(ProcessType::Sink), fields!());
                let mut received = 0u64;
                while !role.done() {
                    let item = role.recv(&sockets.receiver)?;
                    role.process(item)?;
                    received += 1;
                }
                logger.debug(
                    "COLLECTED",
                    Some(ProcessType::Sink),
                    fields! { "results" => received },
                );
                Ok(())
            })
    }
}

/// The marker must be the first message the sink sees.
fn await_marker(sockets: &SinkSockets) -> Result<()> {
    let socket = sockets.handshake.as_ref().unwrap_or(&sockets.receiver);
    let first = recv_bytes(socket)?;
    if first != SYNC_MARKER {
        return Err(TaskventError::Protocol(format!(
            "first message on the sink was {} instead of the synchronization marker",
            describe_payload(&first)
        )));
    }
    if let Some(rep) = &sockets.handshake {
        send_bytes(rep, SYNC_ACK)?;
    }
    Ok(())
}
