//! The ventilator role: produces work items and pushes them to workers.

use super::SyncMode;
use super::lifecycle::{Lifecycle, LifecycleState, Phases, RunReport};
use crate::error::{Result, TaskventError};
use crate::relay::{Logger, ProcessType, fields};
use crate::transport::message::describe_payload;
use crate::transport::{
    BIND_ANY, DEFAULT_MAX_RETRIES, EndpointSpec, LOCALHOST, SYNC_ACK, SYNC_MARKER, apply_hwm,
    bind_endpoint, connect_endpoint, recv_bytes, send_bytes,
};

/// Source of work for a pipeline.
pub trait Ventilator: Phases {
    type Item;
    type Items: IntoIterator<Item = Self::Item>;

    /// The work to dispatch. Called once per run; may block between items.
    fn produce(&mut self) -> Self::Items;

    /// Encode and transmit one item on the workers' channel.
    fn send(&mut self, socket: &zmq::Socket, item: Self::Item) -> Result<()>;
}

struct VentilatorSockets {
    sender: zmq::Socket,
    sink: zmq::Socket,
    handshake: Option<zmq::Socket>,
}

/// Owns a [`Ventilator`] and its sockets and runs it through its lifecycle.
pub struct VentilatorRunner<V: Ventilator> {
    role: V,
    lifecycle: Lifecycle,
    sync: SyncMode,
    sockets: Option<VentilatorSockets>,
    port: Option<u16>,
}

impl<V: Ventilator> VentilatorRunner<V> {
    pub fn new(role: V, logger: Logger) -> Self {
        Self {
            role,
            lifecycle: Lifecycle::new(ProcessType::Ventilator, logger),
            sync: SyncMode::Tolerant,
            sockets: None,
            port: None,
        }
    }

    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Bind the workers' channel and connect to the sink.
    ///
    /// Returns the port the workers' channel was bound to, which is only
    /// interesting when `sender` was a range.
    pub fn initialize_sockets(
        &mut self,
        context: zmq::Context,
        sender: &EndpointSpec,
        sink: &EndpointSpec,
        sender_hwm: Option<i32>,
    ) -> Result<u16> {
        self.lifecycle.ensure_uninitialized()?;

        let sender_socket = context.socket(zmq::PUSH)?;
        apply_hwm(&sender_socket, sender_hwm)?;
        let port = bind_endpoint(&sender_socket, sender, BIND_ANY, DEFAULT_MAX_RETRIES)?;
        self.lifecycle.debug(
            "BOUND_SENDER",
            fields! { "port" => port, "hwm" => sender_hwm },
        );

        let sink_socket = context.socket(zmq::PUSH)?;
        let address = connect_endpoint(&sink_socket, sink, LOCALHOST)?;
        self.lifecycle
            .debug("CONNECTED_SINK", fields! { "address" => address });

        let handshake = match &self.sync {
            SyncMode::Tolerant => None,
            SyncMode::Handshake { endpoint } => {
                let socket = context.socket(zmq::REQ)?;
                let address = connect_endpoint(&socket, endpoint, LOCALHOST)?;
                self.lifecycle
                    .debug("CONNECTED_HANDSHAKE", fields! { "address" => address });
                Some(socket)
            }
        };

        self.sockets = Some(VentilatorSockets {
            sender: sender_socket,
            sink: sink_socket,
            handshake,
        });
        self.port = Some(port);
        self.lifecycle.sockets_initialized(context)?;
        Ok(port)
    }

    /// Port the workers' channel is bound to, once sockets are initialized.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Synchronize with the sink, then dispatch everything `produce` yields.
    pub fn run(self) -> RunReport {
        let logger = self.lifecycle.logger().clone();
        self.lifecycle
            .run(self.role, self.sockets, move |role, sockets| {
                synchronize(sockets, &logger)?;
                let mut sent = 0u64;
                for item in role.produce() {
                    role.send(&sockets.sender, item)?;
                    sent += 1;
                }
                logger.debug(
                    "PRODUCED",
                    Some(ProcessType::Ventilator),
                    fields! { "items" => sent },
                );
                Ok(())
            })
    }
}

fn synchronize(sockets: &VentilatorSockets, logger: &Logger) -> Result<()> {
    match &sockets.handshake {
        None => send_bytes(&sockets.sink, SYNC_MARKER)?,
        Some(req) => {
            send_bytes(req, SYNC_MARKER)?;
            let reply = recv_bytes(req)?;
            if reply != SYNC_ACK {
                return Err(TaskventError::Protocol(format!(
                    "expected sink acknowledgement, got {}",
                    describe_payload(&reply)
                )));
            }
        }
    }
    logger.debug("SENT_MARKER", Some(ProcessType::Ventilator), fields!());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryHandler;
    use crate::transport::{recv_json, send_json};
    use std::thread;

    struct Numbers {
        count: u64,
    }

    impl Phases for Numbers {}

    impl Ventilator for Numbers {
        type Item = u64;
        type Items = std::ops::RangeInclusive<u64>;

        fn produce(&mut self) -> Self::Items {
            1..=self.count
        }

        fn send(&mut self, socket: &zmq::Socket, item: u64) -> Result<()> {
            send_json(socket, &item)
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn quiet_logger() -> (Logger, MemoryHandler) {
        let logger = Logger::new("taskvent::ventilator-test");
        let memory = MemoryHandler::new();
        logger.add_handler(memory.clone());
        logger.set_propagate(false);
        (logger, memory)
    }

    #[test]
    fn test_marker_then_items_in_order() {
        let context = zmq::Context::new();
        let sink_port = free_port();
        let sink = context.socket(zmq::PULL).unwrap();
        sink.bind(&format!("tcp://127.0.0.1:{}", sink_port)).unwrap();

        let (logger, memory) = quiet_logger();
        let mut runner = VentilatorRunner::new(Numbers { count: 5 }, logger);
        let port = runner
            .initialize_sockets(
                context.clone(),
                &EndpointSpec::range(40000, 49999).unwrap(),
                &sink_port.into(),
                Some(10),
            )
            .unwrap();
        assert_eq!(runner.port(), Some(port));
        assert_eq!(runner.state(), LifecycleState::SocketsReady);

        let worker = context.socket(zmq::PULL).unwrap();
        worker
            .connect(&format!("tcp://127.0.0.1:{}", port))
            .unwrap();

        let handle = thread::spawn(move || runner.run());

        assert_eq!(sink.recv_bytes(0).unwrap(), SYNC_MARKER);
        let items: Vec<u64> = (0..5).map(|_| recv_json(&worker).unwrap()).collect();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);

        let report = handle.join().unwrap();
        assert!(report.succeeded());
        assert!(report.reached(LifecycleState::Finalized));
        let statuses = memory.statuses();
        assert!(statuses.contains(&"BOUND_SENDER".to_string()));
        assert!(statuses.contains(&"SENT_MARKER".to_string()));
        assert_eq!(statuses.last().map(String::as_str), Some("SHUTDOWN"));
    }

    #[test]
    fn test_handshake_waits_for_acknowledgement() {
        let context = zmq::Context::new();
        let sink_port = free_port();
        let sink = context.socket(zmq::PULL).unwrap();
        sink.bind(&format!("tcp://127.0.0.1:{}", sink_port)).unwrap();
        let handshake_port = free_port();
        let rep = context.socket(zmq::REP).unwrap();
        rep.bind(&format!("tcp://127.0.0.1:{}", handshake_port))
            .unwrap();

        let (logger, _memory) = quiet_logger();
        let mut runner = VentilatorRunner::new(Numbers { count: 3 }, logger)
            .with_sync(SyncMode::handshake(handshake_port));
        let port = runner
            .initialize_sockets(
                context.clone(),
                &EndpointSpec::range(40000, 49999).unwrap(),
                &sink_port.into(),
                None,
            )
            .unwrap();
        let worker = context.socket(zmq::PULL).unwrap();
        worker
            .connect(&format!("tcp://127.0.0.1:{}", port))
            .unwrap();

        let handle = thread::spawn(move || runner.run());

        assert_eq!(rep.recv_bytes(0).unwrap(), SYNC_MARKER);
        // Nothing is dispatched before the acknowledgement.
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(matches!(
            worker.recv_bytes(zmq::DONTWAIT),
            Err(zmq::Error::EAGAIN)
        ));
        rep.send(SYNC_ACK, 0).unwrap();

        let items: Vec<u64> = (0..3).map(|_| recv_json(&worker).unwrap()).collect();
        assert_eq!(items, vec![1, 2, 3]);
        assert!(handle.join().unwrap().succeeded());
        // The marker travelled only over the handshake pair.
        assert!(matches!(
            sink.recv_bytes(zmq::DONTWAIT),
            Err(zmq::Error::EAGAIN)
        ));
    }

    #[test]
    fn test_double_initialization_rejected() {
        let context = zmq::Context::new();
        let (logger, _memory) = quiet_logger();
        let mut runner = VentilatorRunner::new(Numbers { count: 1 }, logger);
        let sink = EndpointSpec::Port(free_port());
        let range = EndpointSpec::range(40000, 49999).unwrap();
        runner
            .initialize_sockets(context.clone(), &range, &sink, None)
            .unwrap();
        let err = runner
            .initialize_sockets(context.clone(), &range, &sink, None)
            .unwrap_err();
        assert!(matches!(err, TaskventError::IllegalState(_)));
    }
}
