//! Shipping log records between processes.
//!
//! Child processes call [`configure_relay`] to push every record of their
//! logger to a supervising process, which runs [`monitor_and_relay`] to feed
//! them into its own logger and to notice fatal failures.

use super::logger::{Handler, Logger};
use super::record::{LogRecord, Severity};
use crate::error::{Result, TaskventError};
use crate::transport::{
    BIND_ANY, DEFAULT_MAX_RETRIES, EndpointSpec, LOCALHOST, bind_endpoint, connect_endpoint,
    uninterruptible,
};

/// Default port for the log relay channel.
pub const DEFAULT_LOG_PORT: u16 = 5559;

/// How long the monitor keeps reading after every watched process exited.
const DRAIN_GRACE_MS: i64 = 250;

/// Something whose liveness the monitor loop can check.
pub trait Liveness {
    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;
}

/// Handler that pushes each record over a ZeroMQ socket as JSON.
pub struct RelayHandler {
    socket: Option<zmq::Socket>,
}

impl RelayHandler {
    pub fn new(socket: zmq::Socket) -> Self {
        Self {
            socket: Some(socket),
        }
    }
}

impl Handler for RelayHandler {
    fn handle(&mut self, record: &LogRecord) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Err(TaskventError::IllegalState(
                "log relay already closed".into(),
            ));
        };
        let payload = record.to_bytes()?;
        uninterruptible(|| socket.send(payload.as_slice(), 0))?;
        Ok(())
    }

    // Dropping the socket lets the owning context terminate.
    fn close(&mut self) {
        self.socket = None;
    }
}

/// Route all of `logger`'s output to `tcp://localhost:<port>`.
///
/// Existing handlers are removed and propagation to the process-wide
/// `tracing` subscriber is switched off, so records are only handled by the
/// receiving process.
pub fn configure_relay(logger: &Logger, context: &zmq::Context, port: u16) -> Result<()> {
    let socket = context.socket(zmq::PUSH)?;
    connect_endpoint(&socket, &EndpointSpec::Port(port), LOCALHOST)?;
    logger.set_propagate(false);
    logger.replace_handlers(RelayHandler::new(socket));
    Ok(())
}

/// Receive relayed records on `port` and hand them to `logger`.
///
/// Loops while `processes` is empty or any of them is alive, then reads
/// whatever is still queued. Returns [`TaskventError::SubprocessFailure`]
/// right after handling a record whose level is at or above
/// `failure_threshold`.
pub fn monitor_and_relay<L: Liveness>(
    logger: &Logger,
    context: &zmq::Context,
    processes: &mut [L],
    port: u16,
    failure_threshold: Severity,
) -> Result<()> {
    monitor_until(logger, context, processes, port, failure_threshold, || false)
}

/// [`monitor_and_relay`] with an extra `stop` predicate checked every poll.
pub fn monitor_until<L, F>(
    logger: &Logger,
    context: &zmq::Context,
    processes: &mut [L],
    port: u16,
    failure_threshold: Severity,
    mut stop: F,
) -> Result<()>
where
    L: Liveness,
    F: FnMut() -> bool,
{
    let receiver = context.socket(zmq::PULL)?;
    bind_endpoint(
        &receiver,
        &EndpointSpec::Port(port),
        BIND_ANY,
        DEFAULT_MAX_RETRIES,
    )?;
    tracing::debug!(port, watched = processes.len(), "Log monitor listening");

    loop {
        if stop() {
            return Ok(());
        }
        if !processes.is_empty() && !any_alive(processes) {
            break;
        }
        match uninterruptible(|| receiver.recv_bytes(zmq::DONTWAIT)) {
            Ok(payload) => dispatch(logger, &payload, port, failure_threshold)?,
            Err(zmq::Error::EAGAIN) => std::thread::yield_now(),
            Err(e) => return Err(e.into()),
        }
    }

    // Records sent just before the last process exited may still be in
    // flight.
    while uninterruptible(|| receiver.poll(zmq::POLLIN, DRAIN_GRACE_MS))? > 0 {
        match uninterruptible(|| receiver.recv_bytes(zmq::DONTWAIT)) {
            Ok(payload) => dispatch(logger, &payload, port, failure_threshold)?,
            Err(zmq::Error::EAGAIN) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Hand one relayed payload to `logger` and escalate it if it is severe
/// enough. Undecodable payloads are skipped.
fn dispatch(
    logger: &Logger,
    payload: &[u8],
    port: u16,
    failure_threshold: Severity,
) -> Result<()> {
    let record = match LogRecord::from_bytes(payload) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(port, error = %e, bytes = payload.len(), "Dropping undecodable log record");
            return Ok(());
        }
    };

    let level = record.level;
    let origin = record.origin();
    let message = record.message.clone();
    logger.handle(record);
    if level >= failure_threshold {
        return Err(TaskventError::SubprocessFailure {
            origin,
            level,
            message,
        });
    }
    Ok(())
}

// Every process is polled so that exited children get reaped promptly.
fn any_alive<L: Liveness>(processes: &mut [L]) -> bool {
    processes
        .iter_mut()
        .fold(false, |alive, process| process.is_alive() || alive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Fields, MemoryHandler, ProcessType};

    /// Stand-in for a child process that stays alive for a number of polls.
    struct FakeProcess {
        polls_left: usize,
    }

    impl Liveness for FakeProcess {
        fn is_alive(&mut self) -> bool {
            if self.polls_left == 0 {
                return false;
            }
            self.polls_left -= 1;
            true
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn parent_logger() -> (Logger, MemoryHandler) {
        let logger = Logger::new("taskvent::monitor-test");
        let memory = MemoryHandler::new();
        logger.add_handler(memory.clone());
        logger.set_propagate(false);
        (logger, memory)
    }

    #[test]
    fn test_configure_relay_replaces_handlers() {
        let context = zmq::Context::new();
        let logger = Logger::new("taskvent::child");
        let local = MemoryHandler::new();
        logger.add_handler(local.clone());
        logger.add_handler(MemoryHandler::new());

        // Nothing is logged afterwards: with nobody listening, a queued record
        // would hold up context termination indefinitely.
        configure_relay(&logger, &context, free_port()).unwrap();
        assert_eq!(logger.handler_count(), 1);
        assert!(!logger.propagates());
        assert!(local.is_empty());
    }

    #[test]
    fn test_below_threshold_is_relayed_without_failure() {
        let context = zmq::Context::new();
        let port = free_port();
        let child = Logger::new("taskvent::child");
        configure_relay(&child, &context, port).unwrap();
        child.log(Severity::Warning, "slow batch", Fields::new());

        let (parent, memory) = parent_logger();
        let watch = memory.clone();
        let mut processes: Vec<FakeProcess> = Vec::new();
        monitor_until(
            &parent,
            &context,
            &mut processes,
            port,
            Severity::Critical,
            || !watch.is_empty(),
        )
        .unwrap();

        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "slow batch");
        assert_eq!(records[0].logger, "taskvent::child");
    }

    #[test]
    fn test_at_threshold_raises_after_handling() {
        let context = zmq::Context::new();
        let port = free_port();
        let child = Logger::new("taskvent::child");
        configure_relay(&child, &context, port).unwrap();
        child.log(Severity::Critical, "worker cannot continue", Fields::new());

        let (parent, memory) = parent_logger();
        let mut processes: Vec<FakeProcess> = Vec::new();
        let err = monitor_and_relay(&parent, &context, &mut processes, port, Severity::Error)
            .unwrap_err();

        match err {
            TaskventError::SubprocessFailure { level, message, .. } => {
                assert_eq!(level, Severity::Critical);
                assert_eq!(message, "worker cannot continue");
            }
            other => panic!("Expected SubprocessFailure, got {:?}", other),
        }
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_empty_process_list_keeps_polling() {
        let context = zmq::Context::new();
        let (parent, memory) = parent_logger();
        let mut processes: Vec<FakeProcess> = Vec::new();
        let mut polls = 0;

        monitor_until(
            &parent,
            &context,
            &mut processes,
            free_port(),
            Severity::Critical,
            || {
                polls += 1;
                polls > 500
            },
        )
        .unwrap();

        assert_eq!(polls, 501);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_exits_when_processes_end() {
        let context = zmq::Context::new();
        let (parent, _memory) = parent_logger();
        let mut processes = vec![FakeProcess { polls_left: 3 }, FakeProcess { polls_left: 10 }];

        monitor_and_relay(
            &parent,
            &context,
            &mut processes,
            free_port(),
            Severity::Critical,
        )
        .unwrap();

        assert!(processes.iter().all(|p| p.polls_left == 0));
    }

    #[test]
    fn test_record_sent_before_exit_still_escalates() {
        let context = zmq::Context::new();
        let port = free_port();
        let push = context.socket(zmq::PUSH).unwrap();
        push.set_reconnect_ivl(10).unwrap();
        push.set_linger(0).unwrap();
        push.connect(&format!("tcp://localhost:{}", port)).unwrap();
        let last_words = LogRecord::new(Severity::Error, "taskvent::child", "sink hwm rejected")
            .with_process_type(ProcessType::Sink);
        push.send(last_words.to_bytes().unwrap(), 0).unwrap();

        // The only watched process has already exited.
        let (parent, memory) = parent_logger();
        let mut processes = vec![FakeProcess { polls_left: 0 }];
        let err = monitor_and_relay(&parent, &context, &mut processes, port, Severity::Error)
            .unwrap_err();

        match err {
            TaskventError::SubprocessFailure { origin, message, .. } => {
                assert!(origin.starts_with("SINK("));
                assert_eq!(message, "sink hwm rejected");
            }
            other => panic!("Expected SubprocessFailure, got {:?}", other),
        }
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_closed_relay_rejects_records() {
        let context = zmq::Context::new();
        let mut handler = RelayHandler::new(context.socket(zmq::PUSH).unwrap());
        handler.close();
        let record = LogRecord::new(Severity::Info, "taskvent::child", "too late");
        assert!(matches!(
            handler.handle(&record),
            Err(TaskventError::IllegalState(_))
        ));

        // Nobody listens on this port, so a queued record would hold up
        // context termination forever.
        let logger = Logger::new("taskvent::child");
        configure_relay(&logger, &context, free_port()).unwrap();
        logger.close_handlers();
        logger.log(Severity::Info, "after close", Fields::new());
        drop(logger);
        drop(context);
    }

    #[test]
    fn test_undecodable_payload_is_skipped() {
        let context = zmq::Context::new();
        let port = free_port();
        let push = context.socket(zmq::PUSH).unwrap();
        push.connect(&format!("tcp://localhost:{}", port)).unwrap();
        push.send("not a record", 0).unwrap();
        let good = LogRecord::new(Severity::Info, "taskvent::child", "fine");
        push.send(good.to_bytes().unwrap(), 0).unwrap();

        let (parent, memory) = parent_logger();
        let watch = memory.clone();
        let mut processes: Vec<FakeProcess> = Vec::new();
        monitor_until(
            &parent,
            &context,
            &mut processes,
            port,
            Severity::Critical,
            || !watch.is_empty(),
        )
        .unwrap();

        assert_eq!(memory.records()[0].message, "fine");
    }
}
