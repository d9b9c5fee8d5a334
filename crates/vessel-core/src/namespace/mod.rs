//! Linux namespace selection and joining.
//!
//! The jail creates namespaces with `clone(2)` flags computed here.
//! [`run_in_namespaces`] lets the supervisor run a callback inside the
//! namespaces of an already running container.

pub mod user;

use std::fs::File;
use std::path::PathBuf;

use nix::sched::CloneFlags;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid};

use vessel_common::error::{Result, VesselError};

/// A namespace kind the jail can isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Mount table.
    Mount,
    /// Network stack.
    Net,
    /// Process ids.
    Pid,
    /// User and group ids.
    User,
    /// Cgroup root view.
    Cgroup,
}

impl Namespace {
    /// Flag passed to `clone(2)`/`setns(2)`.
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Ipc => "ipc",
            Self::Mount => "mnt",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

/// Which namespaces to create for a new container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub net: bool,
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate cgroup namespace.
    pub cgroup: bool,
}

impl NamespaceSet {
    /// Marks `ns` for creation.
    pub const fn enable(&mut self, ns: Namespace) {
        match ns {
            Namespace::Ipc => self.ipc = true,
            Namespace::Mount => self.mount = true,
            Namespace::Net => self.net = true,
            Namespace::Pid => self.pid = true,
            Namespace::User => self.user = true,
            Namespace::Cgroup => self.cgroup = true,
        }
    }

    /// Returns whether `ns` is marked for creation.
    #[must_use]
    pub const fn contains(&self, ns: Namespace) -> bool {
        match ns {
            Namespace::Ipc => self.ipc,
            Namespace::Mount => self.mount,
            Namespace::Net => self.net,
            Namespace::Pid => self.pid,
            Namespace::User => self.user,
            Namespace::Cgroup => self.cgroup,
        }
    }

    /// Combined `clone(2)` flags for every enabled namespace.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        [
            Namespace::Ipc,
            Namespace::Mount,
            Namespace::Net,
            Namespace::Pid,
            Namespace::User,
            Namespace::Cgroup,
        ]
        .into_iter()
        .filter(|ns| self.contains(*ns))
        .fold(CloneFlags::empty(), |acc, ns| acc | ns.clone_flag())
    }
}

/// Runs `f` in a forked child that joined the given namespaces of `pid`.
///
/// Namespace files are opened before any `setns(2)` so that entering the
/// mount namespace does not change how later paths resolve. The callback's
/// failure is reported through the child's exit status.
///
/// # Errors
///
/// Returns an error if a namespace file cannot be opened, the fork fails, or
/// the child exits unsuccessfully.
#[cfg(target_os = "linux")]
pub fn run_in_namespaces<F>(pid: Pid, namespaces: &[Namespace], f: F) -> Result<()>
where
    F: FnOnce() -> std::io::Result<()>,
{
    let mut files = Vec::with_capacity(namespaces.len());
    for ns in namespaces {
        let path = PathBuf::from(format!("/proc/{pid}/ns/{}", ns.proc_name()));
        let file = File::open(&path).map_err(|e| VesselError::io(&path, e))?;
        files.push((*ns, file));
    }

    // SAFETY: the child only calls setns(2), the callback, and _exit(2); it
    // never returns into the caller's stack frames.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            let mut code = 0;
            for (ns, file) in &files {
                if nix::sched::setns(file, ns.clone_flag()).is_err() {
                    code = 1;
                    break;
                }
            }
            if code == 0 && f().is_err() {
                code = 1;
            }
            // SAFETY: terminating the forked child without running atexit
            // handlers inherited from the parent.
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(files);
            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
                    Ok(WaitStatus::Exited(_, code)) => {
                        return Err(VesselError::JailFailed {
                            message: format!("callback in namespaces of {pid} exited with {code}"),
                        });
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        return Err(VesselError::JailFailed {
                            message: format!("callback in namespaces of {pid} killed by {sig}"),
                        });
                    }
                    Ok(_) | Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => {
                        return Err(VesselError::JailFailed {
                            message: format!("waitpid({child}) failed: {e}"),
                        });
                    }
                }
            }
        }
        Err(e) => Err(VesselError::JailFailed {
            message: format!("fork failed: {e}"),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; joining namespaces requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn run_in_namespaces<F>(_pid: Pid, _namespaces: &[Namespace], _f: F) -> Result<()>
where
    F: FnOnce() -> std::io::Result<()>,
{
    Err(VesselError::JailFailed {
        message: "Linux required for native container operations".into(),
    })
}
