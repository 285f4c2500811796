//! The worker role: turns each work item into zero or more results.

use super::lifecycle::{Lifecycle, LifecycleState, Phases, RunReport};
use crate::error::Result;
use crate::relay::{Logger, ProcessType, fields};
use crate::transport::{EndpointSpec, LOCALHOST, apply_hwm, connect_endpoint};

/// Transformation stage of a pipeline.
pub trait Worker: Phases {
    type Input;
    type Output;
    type Outputs: IntoIterator<Item = Self::Output>;

    /// Receive and decode one work item.
    fn recv(&mut self, socket: &zmq::Socket) -> Result<Self::Input>;

    /// Expand one work item into its results.
    fn process(&mut self, input: Self::Input) -> Result<Self::Outputs>;

    /// Encode and transmit one result to the sink.
    fn send(&mut self, socket: &zmq::Socket, output: Self::Output) -> Result<()>;

    /// Checked before every item. A worker usually cannot tell when the
    /// stream has ended, so by default it runs until it is terminated.
    fn done(&self) -> bool {
        false
    }
}

struct WorkerSockets {
    receiver: zmq::Socket,
    sender: zmq::Socket,
}

/// Owns a [`Worker`] and its sockets and runs it through its lifecycle.
pub struct WorkerRunner<W: Worker> {
    role: W,
    lifecycle: Lifecycle,
    sockets: Option<WorkerSockets>,
}

impl<W: Worker> WorkerRunner<W> {
    pub fn new(role: W, logger: Logger) -> Self {
        Self {
            role,
            lifecycle: Lifecycle::new(ProcessType::Worker, logger),
            sockets: None,
        }
    }

    /// Connect to the ventilator and to the sink. Ranges are rejected since
    /// workers never bind.
    pub fn initialize_sockets(
        &mut self,
        context: zmq::Context,
        receiver: &EndpointSpec,
        receiver_hwm: Option<i32>,
        sender: &EndpointSpec,
        sender_hwm: Option<i32>,
    ) -> Result<()> {
        self.lifecycle.ensure_uninitialized()?;

        let receiver_socket = context.socket(zmq::PULL)?;
        apply_hwm(&receiver_socket, receiver_hwm)?;
        let address = connect_endpoint(&receiver_socket, receiver, LOCALHOST)?;
        self.lifecycle.debug(
            "CONNECTED_VENTILATOR",
            fields! { "address" => address, "hwm" => receiver_hwm },
        );

        let sender_socket = context.socket(zmq::PUSH)?;
        apply_hwm(&sender_socket, sender_hwm)?;
        let address = connect_endpoint(&sender_socket, sender, LOCALHOST)?;
        self.lifecycle.debug(
            "CONNECTED_SINK",
            fields! { "address" => address, "hwm" => sender_hwm },
        );

        self.sockets = Some(WorkerSockets {
            receiver: receiver_socket,
            sender: sender_socket,
        });
        self.lifecycle.sockets_initialized(context)
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Receive, process and forward items until `done` returns true.
    pub fn run(self) -> RunReport {
        self.lifecycle.run(self.role, self.sockets, |role, sockets| {
            while !role.done() {
                let input = role.recv(&sockets.receiver)?;
                for output in role.process(input)? {
                    role.send(&sockets.sender, output)?;
                }
            }
            Ok(())
        })
    }
}
