//! Reference pipeline: the ventilator emits `1..=count`, workers square each
//! number and the sink adds the squares up.
//!
//! The sink reports the total on a separate PUSH socket connected to
//! `tcp://localhost:<result_port>`, which the supervising process binds.

use crate::error::{Result, TaskventError};
use crate::roles::{Phases, Sink, Ventilator, Worker};
use crate::transport::{EndpointSpec, LOCALHOST, connect_endpoint, recv_json, send_json};
use std::time::Duration;

/// Pause before dispatching so that every worker has time to connect;
/// otherwise the first worker to connect receives most of the items.
pub const STARTUP_DELAY: Duration = Duration::from_millis(250);

/// Sum of the squares of `1..=count`.
pub fn expected_sum(count: u64) -> u64 {
    count * (count + 1) * (2 * count + 1) / 6
}

/// Emits the numbers `1..=count`.
#[derive(Debug, Clone)]
pub struct SquaresVentilator {
    count: u64,
    startup_delay: Duration,
}

impl SquaresVentilator {
    pub fn new(count: u64) -> Self {
        Self {
            count,
            startup_delay: STARTUP_DELAY,
        }
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

impl Phases for SquaresVentilator {
    fn setup(&mut self, _context: &zmq::Context) -> Result<()> {
        std::thread::sleep(self.startup_delay);
        Ok(())
    }
}

impl Ventilator for SquaresVentilator {
    type Item = u64;
    type Items = std::ops::RangeInclusive<u64>;

    fn produce(&mut self) -> Self::Items {
        1..=self.count
    }

    fn send(&mut self, socket: &zmq::Socket, item: u64) -> Result<()> {
        send_json(socket, &item)
    }
}

/// Squares every number it receives.
#[derive(Debug, Clone, Default)]
pub struct SquaresWorker;

impl Phases for SquaresWorker {}

impl Worker for SquaresWorker {
    type Input = u64;
    type Output = u64;
    type Outputs = std::iter::Once<u64>;

    fn recv(&mut self, socket: &zmq::Socket) -> Result<u64> {
        recv_json(socket)
    }

    fn process(&mut self, input: u64) -> Result<Self::Outputs> {
        input
            .checked_mul(input)
            .map(std::iter::once)
            .ok_or_else(|| TaskventError::task(format!("{} squared overflows u64", input)))
    }

    fn send(&mut self, socket: &zmq::Socket, output: u64) -> Result<()> {
        send_json(socket, &output)
    }
}

/// Adds up `expected` squares, then reports the total.
pub struct SquaresSink {
    expected: u64,
    received: u64,
    sum: u64,
    result_port: Option<u16>,
    result_socket: Option<zmq::Socket>,
}

impl std::fmt::Debug for SquaresSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SquaresSink")
            .field("expected", &self.expected)
            .field("received", &self.received)
            .field("sum", &self.sum)
            .field("result_port", &self.result_port)
            .field("connected", &self.result_socket.is_some())
            .finish()
    }
}

impl SquaresSink {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            received: 0,
            sum: 0,
            result_port: None,
            result_socket: None,
        }
    }

    /// Report the total to `tcp://localhost:<port>` once done.
    pub fn with_result_port(mut self, port: u16) -> Self {
        self.result_port = Some(port);
        self
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl Phases for SquaresSink {
    fn setup(&mut self, context: &zmq::Context) -> Result<()> {
        if let Some(port) = self.result_port {
            let socket = context.socket(zmq::PUSH)?;
            connect_endpoint(&socket, &EndpointSpec::Port(port), LOCALHOST)?;
            self.result_socket = Some(socket);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        tracing::info!(sum = self.sum, received = self.received, "Sum of squares");
        if let Some(socket) = &self.result_socket {
            send_json(socket, &self.sum)?;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.result_socket = None;
        Ok(())
    }
}

impl Sink for SquaresSink {
    type Item = u64;

    fn recv(&mut self, socket: &zmq::Socket) -> Result<u64> {
        recv_json(socket)
    }

    fn process(&mut self, item: u64) -> Result<()> {
        self.sum = self
            .sum
            .checked_add(item)
            .ok_or_else(|| TaskventError::task("sum of squares overflows u64"))?;
        self.received += 1;
        Ok(())
    }

    fn done(&self) -> bool {
        self.received >= self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Logger;
    use crate::roles::{SinkRunner, VentilatorRunner, WorkerRunner};
    use std::thread;

    #[test]
    fn test_expected_sum() {
        assert_eq!(expected_sum(0), 0);
        assert_eq!(expected_sum(3), 14);
        assert_eq!(expected_sum(50), 42925);
    }

    #[test]
    fn test_worker_squares() {
        let mut worker = SquaresWorker;
        assert_eq!(worker.process(7).unwrap().collect::<Vec<_>>(), vec![49]);
        assert!(worker.process(u64::MAX).is_err());
    }

    #[test]
    fn test_sink_debug_output() {
        let sink = SquaresSink::new(3).with_result_port(6000);
        let rendered = format!("{:?}", sink);
        assert!(rendered.contains("result_port: Some(6000)"));
        assert!(rendered.contains("connected: false"));
    }

    #[test]
    fn test_sink_sums_until_expected() {
        let mut sink = SquaresSink::new(3);
        for item in [1, 4, 9] {
            assert!(!sink.done());
            sink.process(item).unwrap();
        }
        assert!(sink.done());
        assert_eq!(sink.sum(), 14);
        assert_eq!(sink.received(), 3);
    }

    #[test]
    fn test_pipeline_in_threads() {
        let context = zmq::Context::new();
        let results = context.socket(zmq::PULL).unwrap();
        results.bind("tcp://127.0.0.1:*").unwrap();
        let result_port: u16 = results
            .get_last_endpoint()
            .unwrap()
            .unwrap()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let logger = Logger::new("taskvent::squares-test");
        logger.set_propagate(false);
        let range = EndpointSpec::range(40000, 49999).unwrap();

        let mut sink = SinkRunner::new(
            SquaresSink::new(50).with_result_port(result_port),
            logger.clone(),
        );
        let sink_port = sink.initialize_sockets(context.clone(), &range, None).unwrap();

        let mut ventilator = VentilatorRunner::new(
            SquaresVentilator::new(50).with_startup_delay(Duration::from_millis(100)),
            logger.clone(),
        );
        let ventilator_port = ventilator
            .initialize_sockets(context.clone(), &range, &sink_port.into(), None)
            .unwrap();

        // Workers never finish on their own, so only the other roles are joined.
        let mut worker = WorkerRunner::new(SquaresWorker, logger.clone());
        worker
            .initialize_sockets(
                context.clone(),
                &ventilator_port.into(),
                None,
                &sink_port.into(),
                None,
            )
            .unwrap();

        let sink = thread::spawn(move || sink.run());
        let _worker = thread::spawn(move || worker.run());
        let ventilator = thread::spawn(move || ventilator.run());

        let sum: u64 = recv_json(&results).unwrap();
        assert_eq!(sum, expected_sum(50));
        assert!(ventilator.join().unwrap().succeeded());
        assert!(sink.join().unwrap().succeeded());
    }
}
