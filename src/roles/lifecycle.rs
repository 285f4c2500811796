//! Lifecycle shared by the ventilator, worker and sink roles.
//!
//! Each role process walks through the same linear state machine:
//!
//! ```text
//! Uninitialized -> SocketsReady -> Running -> Finalized -> TornDown
//!                                         \-> Failed    -/
//! ```
//!
//! [`Lifecycle::run`] drives the phases in order, contains every error or
//! panic raised by setup, the work loop or finalize in a single handler that
//! logs it, and always runs teardown before terminating the process's
//! messaging context.

use crate::error::{Result, TaskventError};
use crate::relay::{Fields, LogRecord, Logger, ProcessType, Severity, fields};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Lifecycle state of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    SocketsReady,
    Running,
    Finalized,
    Failed,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::SocketsReady => "SOCKETS_READY",
            Self::Running => "RUNNING",
            Self::Finalized => "FINALIZED",
            Self::Failed => "FAILED",
            Self::TornDown => "TORN_DOWN",
        };
        f.write_str(name)
    }
}

/// Optional hooks around a role's work loop. All default to no-ops.
pub trait Phases {
    /// Called before any processing. `context` is the process's messaging
    /// context, for roles that need extra sockets.
    fn setup(&mut self, _context: &zmq::Context) -> Result<()> {
        Ok(())
    }

    /// Called after the work loop completed successfully.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called last, whether or not the run succeeded.
    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of [`Lifecycle::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub process_type: ProcessType,
    pub pid: u32,
    /// Every state visited, in order.
    pub transitions: Vec<LifecycleState>,
    /// Rendered error for a failed run.
    pub failure: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn reached(&self, state: LifecycleState) -> bool {
        self.transitions.contains(&state)
    }
}

/// State machine and context ownership for one role process.
pub struct Lifecycle {
    process_type: ProcessType,
    logger: Logger,
    context: Option<zmq::Context>,
    transitions: Vec<LifecycleState>,
}

impl Lifecycle {
    pub fn new(process_type: ProcessType, logger: Logger) -> Self {
        Self {
            process_type,
            logger,
            context: None,
            transitions: vec![LifecycleState::Uninitialized],
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(LifecycleState::Uninitialized)
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Emit a key/value debug event tagged with this role's process type.
    pub fn debug(&self, status: &str, fields: Fields) {
        self.logger.debug(status, Some(self.process_type), fields);
    }

    /// Fail unless sockets have not been set up yet.
    pub fn ensure_uninitialized(&self) -> Result<()> {
        if self.state() != LifecycleState::Uninitialized {
            return Err(TaskventError::IllegalState(format!(
                "{} sockets already initialized (state {})",
                self.process_type,
                self.state()
            )));
        }
        Ok(())
    }

    /// Record that the role's sockets exist and take ownership of `context`.
    ///
    /// Callers should not keep their own handle: the context is only
    /// terminated once every handle and socket is gone.
    pub fn sockets_initialized(&mut self, context: zmq::Context) -> Result<()> {
        self.ensure_uninitialized()?;
        self.context = Some(context);
        self.transition(LifecycleState::SocketsReady);
        self.debug("SOCKETS_INITIALIZED", fields!());
        Ok(())
    }

    fn transition(&mut self, state: LifecycleState) {
        self.transitions.push(state);
    }

    /// Run `role` to completion.
    ///
    /// Errors and panics are logged, never propagated. After teardown the
    /// role's sockets and the role itself are dropped and the logger's
    /// handlers are closed. Dropping the context last terminates it, which
    /// blocks until queued outbound messages are flushed.
    pub fn run<P, S, F>(mut self, mut role: P, sockets: Option<S>, work_loop: F) -> RunReport
    where
        P: Phases,
        F: FnOnce(&mut P, &S) -> Result<()>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(&mut role, sockets.as_ref(), work_loop)
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(render_error(&e)),
            Err(payload) => Some(render_panic(payload.as_ref())),
        };
        match &failure {
            None => self.transition(LifecycleState::Finalized),
            Some(text) => {
                self.transition(LifecycleState::Failed);
                self.handle_exception(text);
            }
        }

        self.debug("TEARDOWN", fields!());
        match panic::catch_unwind(AssertUnwindSafe(|| role.teardown())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.handle_exception(&render_error(&e)),
            Err(payload) => self.handle_exception(&render_panic(payload.as_ref())),
        }
        self.debug("SHUTDOWN", fields!());

        drop(sockets);
        drop(role);
        self.logger.close_handlers();
        drop(self.context.take());
        self.transition(LifecycleState::TornDown);

        RunReport {
            process_type: self.process_type,
            pid: std::process::id(),
            transitions: self.transitions,
            failure,
        }
    }

    fn execute<P, S, F>(&mut self, role: &mut P, sockets: Option<&S>, work_loop: F) -> Result<()>
    where
        P: Phases,
        F: FnOnce(&mut P, &S) -> Result<()>,
    {
        self.debug("SETUP", fields!());
        let sockets = self.verify_sockets(sockets)?;
        self.transition(LifecycleState::Running);
        let context = self.context.as_ref().ok_or_else(|| {
            TaskventError::IllegalState("messaging context missing after socket setup".into())
        })?;
        role.setup(context)?;
        self.debug("START", fields!());
        work_loop(role, sockets)?;
        role.finalize()
    }

    fn verify_sockets<'s, S>(&self, sockets: Option<&'s S>) -> Result<&'s S> {
        match sockets {
            Some(sockets) if self.state() == LifecycleState::SocketsReady => Ok(sockets),
            _ => Err(TaskventError::IllegalState(
                "initialize_sockets() must be called before run()".into(),
            )),
        }
    }

    fn handle_exception(&self, text: &str) {
        let pid = std::process::id();
        let record = LogRecord::new(
            Severity::Error,
            self.logger.name(),
            format!("{}({}): encountered exception", self.process_type, pid),
        )
        .with_process_type(self.process_type)
        .with_field("status", "EXCEPTION")
        .with_exc_text(text);
        self.logger.handle(record);
    }
}

/// Render an error and its chain of causes.
fn render_error(error: &TaskventError) -> String {
    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    text
}

fn render_panic(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("panicked: {}", message)
}
