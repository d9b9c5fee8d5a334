//! Supervisor-side callbacks synchronized with the jailed process.
//!
//! A [`HookState`] parks the jailed process at one [`HookEvent`] until the
//! supervisor has run its callbacks. The remaining helpers build the
//! callbacks the container installs itself: work inside the container's
//! mount namespace, `setfiles` labelling, and the SELinux exec context.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use nix::mount::MsFlags;
use nix::unistd::Pid;

use vessel_common::constants::MAX_SETFILES_ARGS;
use vessel_common::error::{Result, VesselError};
use vessel_core::jail::{ChildHook, HookEvent, Jail};
use vessel_core::namespace::{Namespace, run_in_namespaces};
use vessel_core::sync::Rendezvous;

use crate::config::{HookCallback, MountSpec};
use crate::mounts::path_in_outer_namespace;

/// Mount destinations never relabelled by `setfiles`.
const SETFILES_SKIPPED: [&str; 2] = ["/data", "/cache"];

/// Handshake between the supervisor and the jailed process for one event.
///
/// The jailed process signals `reached` and blocks on `ready`; the
/// supervisor waits for `reached`, runs its callbacks, and signals `ready`.
#[derive(Debug)]
pub struct HookState {
    reached: Rendezvous,
    ready: Rendezvous,
    installed: bool,
}

impl HookState {
    /// Creates the two rendezvous pipes.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::JailFailed`] if a pipe cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            reached: Rendezvous::new()?,
            ready: Rendezvous::new()?,
            installed: false,
        })
    }

    /// Adds the child half of the handshake to `jail` at `event`.
    ///
    /// The jail only keeps copies of the raw descriptors. At
    /// [`HookEvent::PreExecve`] the descriptors are also preserved so that
    /// closing open descriptors beforehand does not remove them.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::InvalidState`] if already installed.
    pub fn install_hook(&mut self, jail: &mut Jail, event: HookEvent) -> Result<()> {
        if self.installed {
            return Err(VesselError::InvalidState {
                message: "hook state is already installed".into(),
            });
        }
        let reached = self.reached.fds();
        let ready = self.ready.fds();
        jail.add_hook(
            event,
            Box::new(move || {
                reached.signal();
                ready.wait()
            }),
        );
        if event == HookEvent::PreExecve {
            for fd in [reached.read, reached.write, ready.read, ready.write] {
                jail.preserve_fd(fd, fd);
            }
        }
        self.installed = true;
        Ok(())
    }

    /// Waits until the jailed process reaches the event, runs `callbacks`
    /// in order with its pid, then releases it.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::JailFailed`] without running any callback if
    /// the jailed process dies before reaching the event. Otherwise returns
    /// the first callback error; the jailed process is then not released
    /// and the caller is expected to kill it.
    pub fn wait_for_hook_and_run(&mut self, callbacks: &[HookCallback], pid: Pid) -> Result<()> {
        self.reached.wait().map_err(|e| match e {
            VesselError::JailFailed { message } => VesselError::JailFailed {
                message: format!("jailed process {pid} did not reach its hook: {message}"),
            },
            other => other,
        })?;
        for callback in callbacks {
            callback(pid)?;
        }
        self.ready.signal();
        Ok(())
    }
}

/// Wraps `f` into a callback that runs it in a child process joined to the
/// jailed process's mount namespace.
pub fn in_mount_namespace<F>(f: F) -> HookCallback
where
    F: Fn() -> std::io::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |pid| run_in_namespaces(pid, &[Namespace::Mount], || f()))
}

/// Destinations, outside the container, of the writable mounts performed by
/// the supervisor. `/data` and `/cache` are left out.
#[must_use]
pub fn setfiles_destinations(mounts: &[MountSpec], root: &Path) -> Vec<PathBuf> {
    mounts
        .iter()
        .filter(|m| !m.mount_in_ns && !m.flags.contains(MsFlags::MS_RDONLY))
        .filter(|m| !SETFILES_SKIPPED.iter().any(|s| m.destination == Path::new(s)))
        .map(|m| path_in_outer_namespace(root, &m.destination))
        .collect()
}

/// Runs `setfiles -r <root> <root>/file_contexts <destinations...>` with an
/// empty environment.
///
/// # Errors
///
/// Returns an error if there are too many destinations, the command cannot
/// be started, or it does not exit successfully.
pub fn run_setfiles(setfiles: &Path, root: &Path, destinations: &[PathBuf]) -> std::io::Result<()> {
    if destinations.len() + 4 >= MAX_SETFILES_ARGS {
        return Err(std::io::Error::from_raw_os_error(libc::E2BIG));
    }
    let status = Command::new(setfiles)
        .arg("-r")
        .arg(root)
        .arg(root.join("file_contexts"))
        .args(destinations)
        .env_clear()
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "{} exited with {status}",
            setfiles.display()
        )))
    }
}

/// Child hook writing `context` to the calling thread's `attr/exec`, so the
/// next `execve(2)` switches to that SELinux context.
#[must_use]
pub fn selinux_exec_hook(context: &str) -> ChildHook {
    let context = context.to_owned();
    Box::new(move || {
        let tid = nix::unistd::gettid();
        let path = format!("/proc/self/task/{tid}/attr/exec");
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)?
            .write_all(context.as_bytes())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use vessel_core::process::ExitStatus;

    use super::*;

    fn spec(destination: &str, flags: MsFlags, mount_in_ns: bool) -> MountSpec {
        MountSpec {
            name: destination.into(),
            source: PathBuf::from("/src"),
            destination: PathBuf::from(destination),
            fstype: "bind".into(),
            data: None,
            verity: None,
            flags,
            uid: 0,
            gid: 0,
            mode: 0o750,
            mount_in_ns,
            create: false,
            loopback: false,
        }
    }

    #[test]
    fn setfiles_skips_readonly_namespace_and_data_mounts() {
        let mounts = [
            spec("/vendor", MsFlags::MS_BIND, false),
            spec("/system", MsFlags::MS_BIND | MsFlags::MS_RDONLY, false),
            spec("/proc", MsFlags::empty(), true),
            spec("/data", MsFlags::MS_BIND, false),
            spec("/cache", MsFlags::MS_BIND, false),
        ];
        assert_eq!(
            setfiles_destinations(&mounts, Path::new("/run/c/root")),
            vec![PathBuf::from("/run/c/root/vendor")]
        );
    }

    #[test]
    fn setfiles_rejects_too_many_destinations() {
        let destinations = vec![PathBuf::from("/x"); MAX_SETFILES_ARGS];
        let err = run_setfiles(Path::new("/bin/true"), Path::new("/"), &destinations)
            .expect_err("too many");
        assert_eq!(err.raw_os_error(), Some(libc::E2BIG));
    }

    #[test]
    fn setfiles_reports_failure_status() {
        assert!(run_setfiles(Path::new("/bin/true"), Path::new("/"), &[]).is_ok());
        assert!(run_setfiles(Path::new("/bin/false"), Path::new("/"), &[]).is_err());
    }

    #[test]
    fn hook_state_installs_once() {
        let mut jail = Jail::new();
        let mut state = HookState::new().expect("hook state");
        state.install_hook(&mut jail, HookEvent::PreChroot).expect("install");
        assert!(state.install_hook(&mut jail, HookEvent::PreChroot).is_err());
    }

    #[test]
    fn callbacks_run_while_child_is_parked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("marker");

        let mut jail = Jail::new();
        let mut state = HookState::new().expect("hook state");
        state.install_hook(&mut jail, HookEvent::PreExecve).expect("install");

        let seen = Arc::new(Mutex::new(None));
        let seen_cb = Arc::clone(&seen);
        let marker_cb = marker.clone();
        let callback: HookCallback = Arc::new(move |pid| {
            // The program has not run yet, so the marker cannot exist.
            *seen_cb.lock().expect("lock") = Some((pid, marker_cb.exists()));
            Ok(())
        });

        let script = format!("touch {}", marker.display());
        let pid = jail
            .spawn(&["/bin/sh".into(), "-c".into(), script])
            .expect("spawn");
        state
            .wait_for_hook_and_run(&[callback], pid)
            .expect("hook ran");
        assert_eq!(jail.wait().expect("wait"), Some(ExitStatus::Exited(0)));

        assert_eq!(*seen.lock().expect("lock"), Some((pid, false)));
        assert!(marker.exists());
    }

    #[test]
    fn callbacks_are_skipped_when_child_dies_before_the_event() {
        let mut jail = Jail::new();
        jail.add_hook(
            HookEvent::PreChroot,
            Box::new(|| Err(std::io::Error::other("setup failed"))),
        );
        let mut state = HookState::new().expect("hook state");
        state.install_hook(&mut jail, HookEvent::PreExecve).expect("install");

        let ran = Arc::new(Mutex::new(false));
        let ran_cb = Arc::clone(&ran);
        let callback: HookCallback = Arc::new(move |_| {
            *ran_cb.lock().expect("lock") = true;
            Ok(())
        });

        let pid = jail.spawn(&["/bin/true".into()]).expect("spawn");
        let result = state.wait_for_hook_and_run(&[callback], pid);
        assert!(matches!(result, Err(VesselError::JailFailed { .. })));
        assert!(!*ran.lock().expect("lock"));
        assert!(jail.wait().expect("wait").is_some_and(|s| !s.success()));
    }
}
