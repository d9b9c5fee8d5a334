//! Process jail.
//!
//! A [`Jail`] collects the isolation settings for one contained program:
//! namespaces, id maps, mounts performed inside the new mount namespace,
//! root switch, credentials, rlimits, capabilities, inherited descriptors,
//! and hooks run at fixed points of the child's setup. [`Jail::spawn`]
//! clones the child, finishes the parent-side setup (id maps, cgroup
//! membership, pid file) and only then lets the child proceed.

mod child;

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::sys::signal::Signal;
use nix::unistd::{Gid, Pid, Uid};

use vessel_common::constants::MAX_RLIMITS;
use vessel_common::error::{Result, VesselError};

use crate::capability::CapabilityConfig;
use crate::namespace::user::{IdMap, write_id_maps};
use crate::namespace::{Namespace, NamespaceSet};
use crate::process::{self, ChildTable, ExitStatus};
use crate::sync::Rendezvous;

/// Point in the child's setup at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookEvent {
    /// Inside the new mount namespace, before the root switch.
    PreChroot,
    /// After the root switch and credential change, before capabilities are
    /// dropped.
    PreDropCaps,
    /// Right before `execve(2)`.
    PreExecve,
}

impl HookEvent {
    /// Events in the order the child reaches them.
    pub const ORDER: [Self; 3] = [Self::PreChroot, Self::PreDropCaps, Self::PreExecve];
}

/// Callback run in the jailed child. Its error aborts the child.
pub type ChildHook = Box<dyn FnMut() -> std::io::Result<()>>;

/// A resource limit applied in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    /// `RLIMIT_*` resource number.
    pub resource: i32,
    /// Soft limit.
    pub cur: u64,
    /// Hard limit.
    pub max: u64,
}

/// A mount performed by the child inside its new mount namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailMount {
    /// Source, as seen by the supervisor.
    pub source: PathBuf,
    /// Destination, relative to the new root.
    pub destination: PathBuf,
    /// Filesystem type.
    pub fstype: Option<String>,
    /// Mount flags.
    pub flags: MsFlags,
    /// Filesystem-specific options.
    pub data: Option<String>,
    /// Create the destination if it is missing.
    pub create: bool,
}

/// Isolation settings and handle to the jailed process.
pub struct Jail {
    namespaces: NamespaceSet,
    uid_map: IdMap,
    gid_map: IdMap,
    deny_setgroups: bool,
    uid: Option<Uid>,
    gid: Option<Gid>,
    root: Option<PathBuf>,
    remount_private: bool,
    mounts: Vec<JailMount>,
    cgroup_tasks: Vec<PathBuf>,
    alt_syscall: Option<CString>,
    rlimits: Vec<Rlimit>,
    hooks: Vec<(HookEvent, ChildHook)>,
    preserved_fds: Vec<(RawFd, RawFd)>,
    close_open_fds: bool,
    caps: Option<CapabilityConfig>,
    run_as_init: bool,
    pid_file: Option<PathBuf>,
    children: ChildTable,
    pid: Option<Pid>,
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail")
            .field("namespaces", &self.namespaces)
            .field("root", &self.root)
            .field("mounts", &self.mounts.len())
            .field("hooks", &self.hooks.len())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Default for Jail {
    fn default() -> Self {
        Self::new()
    }
}

impl Jail {
    /// Creates a jail that isolates nothing and runs the program as pid 1
    /// of any pid namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            namespaces: NamespaceSet::default(),
            uid_map: IdMap::default(),
            gid_map: IdMap::default(),
            deny_setgroups: false,
            uid: None,
            gid: None,
            root: None,
            remount_private: true,
            mounts: Vec::new(),
            cgroup_tasks: Vec::new(),
            alt_syscall: None,
            rlimits: Vec::new(),
            hooks: Vec::new(),
            preserved_fds: Vec::new(),
            close_open_fds: false,
            caps: None,
            run_as_init: true,
            pid_file: None,
            children: ChildTable::new(),
            pid: None,
        }
    }

    /// Creates `ns` for the child.
    pub const fn namespace(&mut self, ns: Namespace) {
        self.namespaces.enable(ns);
    }

    /// Namespaces the child will get.
    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceSet {
        &self.namespaces
    }

    /// Sets the UID and GID maps written for the child's user namespace.
    pub fn id_maps(&mut self, uid_map: IdMap, gid_map: IdMap) {
        self.uid_map = uid_map;
        self.gid_map = gid_map;
    }

    /// Disables `setgroups(2)` in the child's user namespace.
    pub const fn disable_setgroups(&mut self) {
        self.deny_setgroups = true;
    }

    /// Switches the child to `uid` after the root switch.
    pub const fn change_uid(&mut self, uid: Uid) {
        self.uid = Some(uid);
    }

    /// Switches the child to `gid` after the root switch.
    pub const fn change_gid(&mut self, gid: Gid) {
        self.gid = Some(gid);
    }

    /// Pivots the child into `root`.
    pub fn enter_pivot_root(&mut self, root: &Path) {
        self.root = Some(root.to_path_buf());
    }

    /// Keeps the propagation of the inherited mount tree unchanged.
    pub const fn skip_remount_private(&mut self) {
        self.remount_private = false;
    }

    /// Queues a mount for the child's mount namespace.
    pub fn mount(&mut self, mount: JailMount) {
        self.mounts.push(mount);
    }

    /// Mounts queued for the child's mount namespace.
    #[must_use]
    pub fn mounts(&self) -> &[JailMount] {
        &self.mounts
    }

    /// Adds the child to the cgroup owning `tasks_path`.
    pub fn add_to_cgroup(&mut self, tasks_path: &Path) {
        self.cgroup_tasks.push(tasks_path.to_path_buf());
    }

    /// Selects an alternate syscall table for the child.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if `table` contains NUL.
    pub fn use_alt_syscall(&mut self, table: &str) -> Result<()> {
        self.alt_syscall = Some(
            CString::new(table)
                .map_err(|_| VesselError::config("alt syscall table contains NUL"))?,
        );
        Ok(())
    }

    /// Adds a resource limit.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if the limit is full.
    pub fn add_rlimit(&mut self, rlimit: Rlimit) -> Result<()> {
        if self.rlimits.len() >= MAX_RLIMITS {
            return Err(VesselError::config(format!(
                "at most {MAX_RLIMITS} rlimits are supported"
            )));
        }
        self.rlimits.push(rlimit);
        Ok(())
    }

    /// Runs `hook` in the child at `event`, after the hooks added earlier
    /// for the same event.
    pub fn add_hook(&mut self, event: HookEvent, hook: ChildHook) {
        self.hooks.push((event, hook));
    }

    /// Makes the supervisor's `parent_fd` available as `child_fd` in the
    /// program.
    pub fn preserve_fd(&mut self, parent_fd: RawFd, child_fd: RawFd) {
        self.preserved_fds.push((parent_fd, child_fd));
    }

    /// Closes every descriptor above stderr that is not preserved.
    pub const fn close_open_fds(&mut self) {
        self.close_open_fds = true;
    }

    /// Restricts the child's capabilities.
    pub const fn use_caps(&mut self, caps: CapabilityConfig) {
        self.caps = Some(caps);
    }

    /// With `false`, a minimal init process becomes pid 1 of the pid
    /// namespace and reaps orphans while the program runs as its child.
    pub const fn run_as_init(&mut self, run_as_init: bool) {
        self.run_as_init = run_as_init;
    }

    /// Writes the child's pid to `path` once it is spawned.
    pub fn write_pid_file(&mut self, path: &Path) {
        self.pid_file = Some(path.to_path_buf());
    }

    /// Pid of the jailed process, once spawned.
    #[must_use]
    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Clones the child and runs `argv` in it.
    ///
    /// The child blocks until the parent has written its id maps, cgroup
    /// membership, and pid file. Failures after that point are reported
    /// through the child's exit status: 127 if the program does not exist,
    /// 126 if it cannot be executed, 253 for any jail setup failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the jail already ran, `argv` is empty or contains
    /// NUL, `clone(2)` fails, or the parent-side setup fails. In the last
    /// case the child is killed and reaped before returning.
    pub fn spawn(&mut self, argv: &[String]) -> Result<Pid> {
        if self.pid.is_some() {
            return Err(VesselError::InvalidState {
                message: "jail already spawned a process".into(),
            });
        }
        if argv.is_empty() {
            return Err(VesselError::config("program argv must not be empty"));
        }
        let argv_c = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| VesselError::config("program argument contains NUL"))?;

        let mut sync = Rendezvous::new()?;
        let sync_fds = sync.fds();

        // The cgroup namespace is unshared by the child once the parent has
        // moved it into the container cgroup.
        let flags = self.namespaces.clone_flags() - nix::sched::CloneFlags::CLONE_NEWCGROUP;
        #[allow(clippy::cast_sign_loss)]
        let raw_flags = flags.bits() as libc::c_ulong | libc::SIGCHLD as libc::c_ulong;

        let ret = if flags.is_empty() {
            // SAFETY: plain fork(2) so libc's atfork handlers run; the child
            // never returns from `child::run`.
            libc::c_long::from(unsafe { libc::fork() })
        } else {
            // SAFETY: without CLONE_VM and with a null stack, clone(2)
            // behaves like fork(2): the child gets a copy of the address
            // space and continues on a copy of this stack. The child never
            // returns from `child::run`.
            unsafe {
                libc::syscall(
                    libc::SYS_clone,
                    raw_flags,
                    std::ptr::null_mut::<libc::c_void>(),
                    std::ptr::null_mut::<libc::c_void>(),
                    std::ptr::null_mut::<libc::c_void>(),
                    0 as libc::c_ulong,
                )
            }
        };
        if ret < 0 {
            return Err(VesselError::JailFailed {
                message: format!("clone failed: {}", std::io::Error::last_os_error()),
            });
        }
        if ret == 0 {
            child::run(self, sync_fds, &argv_c);
        }

        #[allow(clippy::cast_possible_truncation)]
        let pid = Pid::from_raw(ret as libc::pid_t);
        self.children.track(pid);
        self.pid = Some(pid);

        if let Err(e) = self.setup_parent_side(pid) {
            let _ = process::send_signal(pid, Signal::SIGKILL);
            let _ = self.children.wait(pid);
            let _ = self.children.untrack(pid);
            self.pid = None;
            return Err(e);
        }
        sync.signal();

        tracing::info!(%pid, program = %argv[0], "jailed process spawned");
        Ok(pid)
    }

    fn setup_parent_side(&self, pid: Pid) -> Result<()> {
        if self.namespaces.user {
            write_id_maps(pid.as_raw(), &self.uid_map, &self.gid_map, self.deny_setgroups)
                .map_err(|e| VesselError::JailFailed {
                    message: format!("writing id maps: {e}"),
                })?;
        }
        for tasks in &self.cgroup_tasks {
            std::fs::write(tasks, pid.to_string()).map_err(|e| VesselError::JailFailed {
                message: format!("adding {pid} to {}: {e}", tasks.display()),
            })?;
        }
        if let Some(path) = &self.pid_file {
            std::fs::write(path, format!("{pid}\n")).map_err(|e| VesselError::io(path, e))?;
        }
        Ok(())
    }

    /// Blocks until the jailed process exits.
    ///
    /// Returns `Ok(None)` if the process was reaped elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::InvalidState`] if nothing was spawned, or the
    /// `waitpid(2)` error.
    pub fn wait(&mut self) -> Result<Option<ExitStatus>> {
        let pid = self.spawned()?;
        self.children.wait(pid)
    }

    /// Reaps the jailed process if it already exited.
    ///
    /// # Errors
    ///
    /// Same as [`Jail::wait`].
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let pid = self.spawned()?;
        self.children.try_wait(pid)
    }

    /// Sends `SIGKILL` to the jailed process. A process that is already gone
    /// is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::InvalidState`] if nothing was spawned, or the
    /// `kill(2)` error.
    pub fn kill(&mut self) -> Result<()> {
        let pid = self.spawned()?;
        match process::send_signal(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(VesselError::JailFailed {
                message: format!("kill({pid}) failed: {e}"),
            }),
        }
    }

    fn spawned(&self) -> Result<Pid> {
        self.pid.ok_or_else(|| VesselError::InvalidState {
            message: "jail has not spawned a process".into(),
        })
    }
}
