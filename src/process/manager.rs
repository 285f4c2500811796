//! Runs a ventilator, a sink and a pool of workers as local processes.
//!
//! Every role gets its own forked process with its own messaging context.
//! The processes share nothing but the ports in [`ManagerConfig`]:
//!
//! ```text
//!                 ventilator_port              sink_port
//! VENTILATOR --PUSH-------------> WORKER x N --PUSH---------> SINK
//!     |                                                        ^
//!     +--PUSH (marker) or REQ/REP (handshake) -----------------+
//! ```

use super::proc::{DEFAULT_STOP_TIMEOUT, RoleProcess};
use super::signals::TerminationReason;
use crate::error::{Result, TaskventError};
use crate::relay::{Logger, ProcessType, Severity, configure_relay, fields};
use crate::roles::{
    RunReport, Sink, SinkRunner, SyncMode, Ventilator, VentilatorRunner, Worker, WorkerRunner,
};
use crate::transport::EndpointSpec;
use nix::unistd::{ForkResult, Pid, fork};
use std::panic::{self, AssertUnwindSafe};

/// Port the ventilator binds for workers unless configured otherwise.
pub const DEFAULT_VENTILATOR_PORT: u16 = 5557;

/// Port the sink binds for results unless configured otherwise.
pub const DEFAULT_SINK_PORT: u16 = 5558;

/// Exit status of a child whose role panicked outside the lifecycle.
const PANIC_EXIT_CODE: i32 = 101;

/// Ports, high-water marks and synchronization settings for a pipeline.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub ventilator_port: u16,
    pub sink_port: u16,
    pub ventilator_hwm: Option<i32>,
    pub worker_receiver_hwm: Option<i32>,
    pub worker_sender_hwm: Option<i32>,
    pub sink_hwm: Option<i32>,
    pub sync: SyncMode,
    /// When set, each child relays its log records to this local port.
    pub log_port: Option<u16>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ventilator_port: DEFAULT_VENTILATOR_PORT,
            sink_port: DEFAULT_SINK_PORT,
            ventilator_hwm: None,
            worker_receiver_hwm: None,
            worker_sender_hwm: None,
            sink_hwm: None,
            sync: SyncMode::Tolerant,
            log_port: None,
        }
    }
}

impl ManagerConfig {
    pub fn new(ventilator_port: u16, sink_port: u16) -> Self {
        Self {
            ventilator_port,
            sink_port,
            ..Self::default()
        }
    }

    pub fn with_ventilator_hwm(mut self, hwm: Option<i32>) -> Self {
        self.ventilator_hwm = hwm;
        self
    }

    pub fn with_worker_hwms(mut self, receiver: Option<i32>, sender: Option<i32>) -> Self {
        self.worker_receiver_hwm = receiver;
        self.worker_sender_hwm = sender;
        self
    }

    pub fn with_sink_hwm(mut self, hwm: Option<i32>) -> Self {
        self.sink_hwm = hwm;
        self
    }

    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_log_port(mut self, port: Option<u16>) -> Self {
        self.log_port = port;
        self
    }
}

/// Owns the roles of one pipeline and the processes running them.
///
/// Dropping the manager drops every [`RoleProcess`], which stops it.
pub struct LocalManager<V, S, W> {
    ventilator: Option<V>,
    sink: Option<S>,
    workers: Vec<W>,
    config: ManagerConfig,
    logger: Logger,
    processes: Vec<RoleProcess>,
    launched: bool,
}

impl<V, S, W> LocalManager<V, S, W>
where
    V: Ventilator,
    S: Sink,
    W: Worker,
{
    pub fn new(ventilator: V, sink: S, workers: Vec<W>, config: ManagerConfig) -> Self {
        Self {
            ventilator: Some(ventilator),
            sink: Some(sink),
            workers,
            config,
            logger: Logger::new("taskvent::manager"),
            processes: Vec::new(),
            launched: false,
        }
    }

    /// Logger handed to every role. Children inherit it at fork time.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Fork the ventilator, the sink and every worker.
    ///
    /// Process handles are recorded once all forks have returned, so no
    /// child ever holds a handle to a sibling.
    pub fn launch(&mut self) -> Result<()> {
        if self.launched {
            return Err(TaskventError::IllegalState(
                "launch() may only be called once".into(),
            ));
        }
        let (Some(ventilator), Some(sink)) = (self.ventilator.take(), self.sink.take()) else {
            return Err(TaskventError::IllegalState("roles already consumed".into()));
        };
        let workers = std::mem::take(&mut self.workers);
        self.launched = true;

        let mut pids = Vec::with_capacity(workers.len() + 2);
        let forked = self.fork_all(ventilator, sink, workers, &mut pids);
        self.processes = pids
            .into_iter()
            .map(|(pid, process_type)| RoleProcess::new(pid, process_type))
            .collect();
        forked?;

        let pids: Vec<i32> = self.processes.iter().map(|p| p.pid().as_raw()).collect();
        self.logger.debug(
            "LAUNCHED",
            Some(ProcessType::Manager),
            fields! {
                "ventilator_port" => self.config.ventilator_port,
                "sink_port" => self.config.sink_port,
                "pids" => pids,
            },
        );
        Ok(())
    }

    fn fork_all(
        &self,
        ventilator: V,
        sink: S,
        workers: Vec<W>,
        pids: &mut Vec<(Pid, ProcessType)>,
    ) -> Result<()> {
        let config = &self.config;

        let pid = fork_role(ProcessType::Ventilator, || {
            self.child_main(ProcessType::Ventilator, |context, logger| {
                let mut runner =
                    VentilatorRunner::new(ventilator, logger).with_sync(config.sync.clone());
                runner.initialize_sockets(
                    context,
                    &EndpointSpec::Port(config.ventilator_port),
                    &EndpointSpec::Port(config.sink_port),
                    config.ventilator_hwm,
                )?;
                Ok(runner.run())
            })
        })?;
        pids.push((pid, ProcessType::Ventilator));

        let pid = fork_role(ProcessType::Sink, || {
            self.child_main(ProcessType::Sink, |context, logger| {
                let mut runner = SinkRunner::new(sink, logger).with_sync(config.sync.clone());
                runner.initialize_sockets(
                    context,
                    &EndpointSpec::Port(config.sink_port),
                    config.sink_hwm,
                )?;
                Ok(runner.run())
            })
        })?;
        pids.push((pid, ProcessType::Sink));

        for worker in workers {
            let pid = fork_role(ProcessType::Worker, || {
                self.child_main(ProcessType::Worker, |context, logger| {
                    let mut runner = WorkerRunner::new(worker, logger);
                    runner.initialize_sockets(
                        context,
                        &EndpointSpec::Port(config.ventilator_port),
                        config.worker_receiver_hwm,
                        &EndpointSpec::Port(config.sink_port),
                        config.worker_sender_hwm,
                    )?;
                    Ok(runner.run())
                })
            })?;
            pids.push((pid, ProcessType::Worker));
        }
        Ok(())
    }

    /// Body of a child process. Returns the exit status.
    fn child_main<F>(&self, process_type: ProcessType, body: F) -> i32
    where
        F: FnOnce(zmq::Context, Logger) -> Result<RunReport>,
    {
        let context = zmq::Context::new();
        let logger = self.logger.clone();
        if let Some(port) = self.config.log_port
            && let Err(e) = configure_relay(&logger, &context, port)
        {
            tracing::warn!(port, error = %e, "Could not route logs to the relay");
        }

        let code = match body(context, logger.clone()) {
            Ok(_report) => 0,
            Err(e) => {
                logger.log(
                    Severity::Error,
                    format!(
                        "{}({}): failed to initialize sockets",
                        process_type,
                        std::process::id()
                    ),
                    fields! { "error" => e.to_string() },
                );
                1
            }
        };

        // A run has already closed the relay. After a failed initialization
        // the relay socket holds the last reference to the context, and
        // closing it flushes the error record above.
        logger.close_handlers();
        code
    }

    /// Block until the sink exits, then clean up every process.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        let result = match self.sink_process_mut() {
            Some(sink) => sink.wait(),
            None => Err(TaskventError::IllegalState(
                "wait() called before launch()".into(),
            )),
        };
        self.cleanup();
        if let Ok(reason) = &result {
            self.logger.debug(
                "SINK_EXITED",
                Some(ProcessType::Manager),
                fields! { "reason" => reason.to_string() },
            );
        }
        result
    }

    /// Stop every process that is still alive. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        for process in self.processes.iter_mut() {
            if process.exit_reason().is_some() {
                continue;
            }
            match process.stop(DEFAULT_STOP_TIMEOUT) {
                Ok(reason) => tracing::debug!(
                    pid = %process.pid(),
                    process_type = %process.process_type(),
                    %reason,
                    "Stopped role process"
                ),
                Err(e) => tracing::warn!(
                    pid = %process.pid(),
                    error = %e,
                    "Failed to stop role process"
                ),
            }
        }
    }

    pub fn processes(&self) -> &[RoleProcess] {
        &self.processes
    }

    pub fn sink_process_mut(&mut self) -> Option<&mut RoleProcess> {
        self.processes
            .iter_mut()
            .find(|p| p.process_type() == ProcessType::Sink)
    }
}

/// Fork a child that runs `body` and exits with its return value.
fn fork_role<F: FnOnce() -> i32>(process_type: ProcessType, body: F) -> Result<Pid> {
    // SAFETY: the child never returns into the caller; it runs `body` on
    // this thread and leaves through `process::exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(PANIC_EXIT_CODE);
            std::process::exit(code)
        }
        Err(e) => Err(TaskventError::Process(format!(
            "Failed to fork {} process: {}",
            process_type, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Phases;

    struct Idle;

    impl Phases for Idle {}

    impl Ventilator for Idle {
        type Item = ();
        type Items = Vec<()>;

        fn produce(&mut self) -> Vec<()> {
            Vec::new()
        }

        fn send(&mut self, _socket: &zmq::Socket, _item: ()) -> Result<()> {
            Ok(())
        }
    }

    impl Sink for Idle {
        type Item = ();

        fn recv(&mut self, _socket: &zmq::Socket) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, _item: ()) -> Result<()> {
            Ok(())
        }
    }

    impl Worker for Idle {
        type Input = ();
        type Output = ();
        type Outputs = Vec<()>;

        fn recv(&mut self, _socket: &zmq::Socket) -> Result<()> {
            Ok(())
        }

        fn process(&mut self, _input: ()) -> Result<Vec<()>> {
            Ok(Vec::new())
        }

        fn send(&mut self, _socket: &zmq::Socket, _output: ()) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_config_builders() {
        let config = ManagerConfig::new(6000, 6001)
            .with_ventilator_hwm(Some(10))
            .with_worker_hwms(Some(5), None)
            .with_sink_hwm(Some(20))
            .with_sync(SyncMode::handshake(6002))
            .with_log_port(Some(6003));
        assert_eq!(config.ventilator_port, 6000);
        assert_eq!(config.sink_port, 6001);
        assert_eq!(config.ventilator_hwm, Some(10));
        assert_eq!(config.worker_receiver_hwm, Some(5));
        assert_eq!(config.worker_sender_hwm, None);
        assert_eq!(config.sink_hwm, Some(20));
        assert_eq!(config.sync, SyncMode::handshake(6002));
        assert_eq!(config.log_port, Some(6003));
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.ventilator_port, DEFAULT_VENTILATOR_PORT);
        assert_eq!(config.sink_port, DEFAULT_SINK_PORT);
        assert_eq!(config.sync, SyncMode::Tolerant);
        assert!(config.log_port.is_none());
    }

    #[test]
    fn test_wait_before_launch_is_illegal() {
        let mut manager = LocalManager::new(Idle, Idle, vec![Idle], ManagerConfig::default());
        assert!(manager.processes().is_empty());
        assert!(matches!(
            manager.wait(),
            Err(TaskventError::IllegalState(_))
        ));
        // Cleanup with nothing launched is a no-op, and repeatable.
        manager.cleanup();
        manager.cleanup();
    }
}
