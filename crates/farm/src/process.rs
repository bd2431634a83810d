//! Process control abstraction.
//!
//! The worker pool supervises transcode subprocesses through the
//! [`ProcessControl`] trait so the pool logic stays platform-neutral.
//! Suspend/resume map to SIGSTOP/SIGCONT on unix targets.

use std::io;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error type for process supervision
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Command line was empty
    #[error("Empty command line")]
    EmptyCommand,

    /// Process failed to start
    #[error("Failed to spawn process: {0}")]
    Spawn(io::Error),

    /// Signal delivery failed
    #[error("Signal delivery failed: {0}")]
    Signal(io::Error),

    /// Suspend/resume is not available on this platform
    #[error("Suspend/resume is not supported on this platform")]
    Unsupported,

    /// IO error while waiting on the process
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Control surface over one live subprocess.
///
/// `terminate` requests a graceful shutdown, `kill` is unconditional,
/// `suspend`/`resume` stop and continue execution without ending the
/// process.
pub trait ProcessControl: Send {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Request graceful termination.
    fn terminate(&mut self) -> Result<(), ProcessError>;

    /// Force-kill the process.
    fn kill(&mut self) -> Result<(), ProcessError>;

    /// Suspend execution (pause).
    fn suspend(&mut self) -> Result<(), ProcessError>;

    /// Continue a suspended process.
    fn resume(&mut self) -> Result<(), ProcessError>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError>;

    /// Block until the process exits.
    fn wait(&mut self) -> Result<ExitStatus, ProcessError>;

    /// Wait for exit up to `timeout`, polling; `None` when still alive.
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ProcessError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

/// [`ProcessControl`] implementation over `std::process::Child`.
pub struct SystemProcess {
    child: Child,
}

/// Spawn a process from an argument list (element 0 is the program) with
/// stdout and stderr piped and stdin closed.
pub fn spawn(argv: &[String]) -> Result<(SystemProcess, ChildStdout, ChildStderr), ProcessError> {
    let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ProcessError::Spawn)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::Spawn(io::Error::other("stdout pipe not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcessError::Spawn(io::Error::other("stderr pipe not captured")))?;

    Ok((SystemProcess { child }, stdout, stderr))
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<(), ProcessError> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(ProcessError::Signal(io::Error::last_os_error()))
    }
}

/// Request graceful termination of an arbitrary pid (SIGTERM).
#[cfg(unix)]
pub fn terminate_pid(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, libc::SIGTERM)
}

/// Force-kill an arbitrary pid (SIGKILL).
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, libc::SIGKILL)
}

/// Suspend an arbitrary pid (SIGSTOP).
#[cfg(unix)]
pub fn suspend_pid(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, libc::SIGSTOP)
}

/// Continue an arbitrary pid (SIGCONT).
#[cfg(unix)]
pub fn resume_pid(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, libc::SIGCONT)
}

impl ProcessControl for SystemProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), ProcessError> {
        terminate_pid(self.child.id())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), ProcessError> {
        // No graceful signal available, fall through to kill.
        self.kill()
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        self.child.kill().map_err(ProcessError::Signal)
    }

    #[cfg(unix)]
    fn suspend(&mut self) -> Result<(), ProcessError> {
        suspend_pid(self.child.id())
    }

    #[cfg(not(unix))]
    fn suspend(&mut self) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported)
    }

    #[cfg(unix)]
    fn resume(&mut self) -> Result<(), ProcessError> {
        resume_pid(self.child.id())
    }

    #[cfg(not(unix))]
    fn resume(&mut self) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported)
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        Ok(self.child.try_wait()?)
    }

    fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        Ok(self.child.wait()?)
    }
}
