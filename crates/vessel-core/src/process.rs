//! Child-process supervision.
//!
//! [`ChildTable`] tracks the pids a supervisor spawned and caches their exit
//! status once reaped, so a pid is never waited on twice and no global
//! signal-handler state is needed.

use std::collections::HashMap;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use vessel_common::error::{Result, VesselError};

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// Shell-style exit code: the exit code, or `128 + signal`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig as i32,
        }
    }

    /// Returns `true` for a zero exit code.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Pids spawned by this process and their exit status once reaped.
#[derive(Debug, Default)]
pub struct ChildTable {
    children: HashMap<Pid, Option<ExitStatus>>,
}

impl ChildTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a freshly spawned child.
    pub fn track(&mut self, pid: Pid) {
        let _ = self.children.insert(pid, None);
    }

    /// Returns whether `pid` is tracked.
    #[must_use]
    pub fn is_tracked(&self, pid: Pid) -> bool {
        self.children.contains_key(&pid)
    }

    /// Stops tracking `pid`, returning its cached status if it was reaped.
    pub fn untrack(&mut self, pid: Pid) -> Option<ExitStatus> {
        self.children.remove(&pid).flatten()
    }

    /// Blocks until `pid` exits and returns its status.
    ///
    /// Interrupted waits are retried. Returns `Ok(None)` if the kernel no
    /// longer knows the child (`ECHILD`), which happens when somebody else
    /// reaped it.
    ///
    /// # Errors
    ///
    /// Returns an error if `pid` is not tracked or `waitpid(2)` fails with
    /// anything but `EINTR`/`ECHILD`.
    pub fn wait(&mut self, pid: Pid) -> Result<Option<ExitStatus>> {
        self.reap(pid, None)
    }

    /// Reaps `pid` if it already exited, without blocking.
    ///
    /// # Errors
    ///
    /// Same as [`ChildTable::wait`].
    pub fn try_wait(&mut self, pid: Pid) -> Result<Option<ExitStatus>> {
        self.reap(pid, Some(WaitPidFlag::WNOHANG))
    }

    fn reap(&mut self, pid: Pid, flags: Option<WaitPidFlag>) -> Result<Option<ExitStatus>> {
        let Some(cached) = self.children.get(&pid).copied() else {
            return Err(VesselError::NotFound {
                kind: "child process",
                id: pid.to_string(),
            });
        };
        if cached.is_some() {
            return Ok(cached);
        }

        let status = loop {
            match waitpid(pid, flags) {
                Ok(WaitStatus::Exited(_, code)) => break Some(ExitStatus::Exited(code)),
                Ok(WaitStatus::Signaled(_, sig, _)) => break Some(ExitStatus::Signaled(sig)),
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    tracing::debug!(%pid, "child already reaped");
                    break None;
                }
                Err(e) => {
                    return Err(VesselError::JailFailed {
                        message: format!("waitpid({pid}) failed: {e}"),
                    });
                }
            }
        };

        if let Some(s) = status {
            tracing::debug!(%pid, code = s.code(), "reaped child");
            let _ = self.children.insert(pid, Some(s));
        }
        Ok(status)
    }
}

/// Returns `true` unless the kernel reports that `pid` does not exist.
///
/// A zombie still counts as alive.
#[must_use]
pub fn is_alive(pid: Pid) -> bool {
    !matches!(signal::kill(pid, None), Err(Errno::ESRCH))
}

/// Sends `sig` to `pid`.
///
/// # Errors
///
/// Returns the raw errno so callers can decide whether `ESRCH` matters.
pub fn send_signal(pid: Pid, sig: Signal) -> std::result::Result<(), Errno> {
    signal::kill(pid, sig)
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[allow(clippy::cast_possible_wrap)]
    fn spawn(cmd: &str, args: &[&str]) -> Pid {
        let child = Command::new(cmd).args(args).spawn().expect("spawn");
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn wait_returns_exit_code() {
        let mut table = ChildTable::new();
        let pid = spawn("sh", &["-c", "exit 3"]);
        table.track(pid);
        let status = table.wait(pid).expect("wait").expect("status");
        assert_eq!(status, ExitStatus::Exited(3));
        assert!(!status.success());
    }

    #[test]
    fn status_is_cached_after_reap() {
        let mut table = ChildTable::new();
        let pid = spawn("true", &[]);
        table.track(pid);
        let first = table.wait(pid).expect("wait");
        let second = table.wait(pid).expect("wait again");
        assert_eq!(first, second);
        assert_eq!(table.untrack(pid), first);
    }

    #[test]
    fn signaled_child_reports_128_plus_signal() {
        let mut table = ChildTable::new();
        let pid = spawn("sleep", &["30"]);
        table.track(pid);
        send_signal(pid, Signal::SIGKILL).expect("kill");
        let status = table.wait(pid).expect("wait").expect("status");
        assert_eq!(status, ExitStatus::Signaled(Signal::SIGKILL));
        assert_eq!(status.code(), 137);
        assert!(!is_alive(pid));
    }

    #[test]
    fn try_wait_on_running_child_returns_none() {
        let mut table = ChildTable::new();
        let pid = spawn("sleep", &["30"]);
        table.track(pid);
        assert_eq!(table.try_wait(pid).expect("try_wait"), None);
        send_signal(pid, Signal::SIGKILL).expect("kill");
        assert!(table.wait(pid).expect("wait").is_some());
    }

    #[test]
    fn untracked_pid_is_rejected() {
        let mut table = ChildTable::new();
        assert!(table.wait(Pid::from_raw(1)).is_err());
    }
}
