//! Handle for a forked role process.

use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{Result, TaskventError};
use crate::relay::{Liveness, ProcessType};
use crate::transport::uninterruptible;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to one role process. Reaps the child on wait and stops it on drop.
#[derive(Debug)]
pub struct RoleProcess {
    pid: Pid,
    process_type: ProcessType,
    /// Set once the child has been reaped.
    exit: Option<TerminationReason>,
}

impl RoleProcess {
    pub fn new(pid: Pid, process_type: ProcessType) -> Self {
        Self {
            pid,
            process_type,
            exit: None,
        }
    }

    /// Adopt a child spawned through `std::process::Command`.
    pub fn from_child(child: std::process::Child, process_type: ProcessType) -> Self {
        Self::new(Pid::from_raw(child.id() as i32), process_type)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    /// How the process ended, if it has been reaped.
    pub fn exit_reason(&self) -> Option<TerminationReason> {
        self.exit
    }

    fn record(&mut self, status: WaitStatus) -> TerminationReason {
        let reason = analyze_wait_status(status);
        if reason.is_terminated() {
            self.exit = Some(reason);
        }
        reason
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match uninterruptible(|| waitpid(self.pid, Some(WaitPidFlag::WNOHANG))) {
            Ok(status) => match self.record(status) {
                reason if reason.is_terminated() => Ok(Some(reason)),
                _ => Ok(None),
            },
            Err(Errno::ECHILD) => {
                self.exit = Some(TerminationReason::Unknown);
                Ok(self.exit)
            }
            Err(e) => Err(TaskventError::Process(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        loop {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            match uninterruptible(|| waitpid(self.pid, None)) {
                Ok(status) => {
                    self.record(status);
                }
                Err(Errno::ECHILD) => self.exit = Some(TerminationReason::Unknown),
                Err(e) => {
                    return Err(TaskventError::Process(format!(
                        "waitpid({}) failed: {}",
                        self.pid, e
                    )));
                }
            }
        }
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TaskventError::Process(format!(
                "Failed to send {:?} to {}: {}",
                sig, self.pid, e
            ))),
        }
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        self.terminate()?;

        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(exit) = self.try_wait()? {
                return Ok(exit);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(pid = %self.pid, process_type = %self.process_type, "Escalating to SIGKILL");
        self.kill()
    }
}

impl Liveness for RoleProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }
}

impl Drop for RoleProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.stop(DEFAULT_STOP_TIMEOUT);
        }
    }
}
