//! Container lifecycle: start, wait, kill and teardown.
//!
//! [`Container::start`] acquires resources in a fixed order (runfs, mounts,
//! cgroup, device policy, jail) and records each one as it goes. Any failure
//! tears down everything recorded so far, so a failed start leaves no
//! mounts, loop devices, cgroups or directories behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::MsFlags;
use nix::unistd::{Gid, Pid, Uid};

use vessel_common::constants::{CGROUP_ROOT, CONTAINER_PID_FILENAME};
use vessel_common::defer::Deferred;
use vessel_common::error::{Result, VesselError};
use vessel_common::types::LifecyclePhase;
use vessel_core::capability::CapabilityConfig;
use vessel_core::cgroup::{Cgroup, CgroupSubsystem};
use vessel_core::filesystem::mount;
use vessel_core::jail::{HookEvent, Jail};
use vessel_core::namespace::Namespace;
use vessel_core::process::ExitStatus;

use crate::callbacks::{self, HookState, in_mount_namespace};
use crate::config::{ContainerConfig, HookCallback};
use crate::devices;
use crate::mounts::{MountContext, MountTable};

/// Mode of the directory the rootfs is bind-mounted on.
const RUNFS_ROOT_MODE: u32 = 0o660;

/// A container and every resource it holds on the host.
pub struct Container {
    name: String,
    rundir: PathBuf,
    cgroup_root: PathBuf,
    cgroup: Option<Cgroup>,
    jail: Option<Jail>,
    init_pid: Option<Pid>,
    config_root: Option<PathBuf>,
    runfs: Option<PathBuf>,
    runfsroot: Option<PathBuf>,
    runfsroot_mounted: bool,
    pid_file: Option<PathBuf>,
    mounts: MountTable,
    hook_states: Vec<(HookState, Vec<HookCallback>)>,
    phase: LifecyclePhase,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("init_pid", &self.init_pid)
            .field("runfs", &self.runfs)
            .field("cgroup", &self.cgroup)
            .field("mounts", &self.mounts)
            .field("hook_states", &self.hook_states.len())
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Creates a container named `name` whose runfs will live in `rundir`.
    #[must_use]
    pub fn new(name: &str, rundir: &Path) -> Self {
        Self {
            name: name.to_owned(),
            rundir: rundir.to_path_buf(),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            cgroup: None,
            jail: None,
            init_pid: None,
            config_root: None,
            runfs: None,
            runfsroot: None,
            runfsroot_mounted: false,
            pid_file: None,
            mounts: MountTable::new(),
            hook_states: Vec::new(),
            phase: LifecyclePhase::Created,
        }
    }

    /// Mount point of the cgroup v1 hierarchies. Defaults to
    /// [`CGROUP_ROOT`].
    pub fn set_cgroup_root(&mut self, root: &Path) {
        self.cgroup_root = root.to_path_buf();
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the init process, once started.
    #[must_use]
    pub const fn pid(&self) -> Option<Pid> {
        self.init_pid
    }

    /// Runfs directory holding the container root, unless the root was
    /// premounted.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.runfs.as_deref()
    }

    /// How far the container got.
    #[must_use]
    pub const fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Starts the container described by `config`.
    ///
    /// Returns once the program has been released to `execve(2)`, after
    /// every supervisor callback ran successfully.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] for an empty program,
    /// [`VesselError::InvalidState`] if the container was already started,
    /// or the error of the first step that failed. Everything acquired
    /// before the failure is released and a spawned process is killed.
    pub fn start(&mut self, config: &ContainerConfig) -> Result<()> {
        if config.program_argv.is_empty() {
            return Err(VesselError::config("program argv must not be empty"));
        }
        if self.phase != LifecyclePhase::Created {
            return Err(VesselError::InvalidState {
                message: format!("container {} was already started", self.name),
            });
        }

        let mut container = Deferred::new(self, |c| c.abort_start());
        container.setup_and_spawn(config)?;
        container.disarm();
        Ok(())
    }

    fn setup_and_spawn(&mut self, config: &ContainerConfig) -> Result<()> {
        if let Some(root) = &config.config_root {
            self.config_root = Some(root.clone());
        }
        let root = match &config.premounted_runfs {
            Some(premounted) => {
                self.runfs = None;
                self.runfsroot = Some(premounted.clone());
                premounted.clone()
            }
            None => self.mount_runfs(config)?,
        };

        let mut jail = Jail::new();
        let ctx = MountContext {
            root: &root,
            config_root: self.config_root.as_deref(),
            uid_map: &config.uid_map,
            gid_map: &config.gid_map,
        };
        self.mounts.mount_all(&config.mounts, &ctx, &mut jail)?;
        self.phase = LifecyclePhase::Mounted;

        let owner = (
            Uid::from_raw(config.uid_map.outside_id(config.cgroup_owner)?),
            Gid::from_raw(config.gid_map.outside_id(config.cgroup_group)?),
        );
        let cgroup = self.cgroup.insert(Cgroup::create(
            &self.name,
            &self.cgroup_root,
            config.cgroup_parent.as_deref(),
            Some(owner),
        )?);

        let running_as_root = nix::unistd::getuid().is_root();
        let mut hook_callbacks: BTreeMap<HookEvent, Vec<HookCallback>> = BTreeMap::new();
        // The device cgroup and mknod both need root.
        if running_as_root {
            if !config.devices.is_empty() {
                let (dev_root, devs) = (root.clone(), config.devices.clone());
                let (uid_map, gid_map) = (config.uid_map.clone(), config.gid_map.clone());
                hook_callbacks
                    .entry(HookEvent::PreChroot)
                    .or_default()
                    .push(in_mount_namespace(move || {
                        devices::create_device_nodes(&dev_root, &devs, &uid_map, &gid_map)
                            .map_err(std::io::Error::other)
                    }));
            }
            if cgroup.path(CgroupSubsystem::Devices).is_some() {
                devices::device_setup(cgroup, &config.cgroup_devices, self.mounts.loop_devices())?;
            }
        }
        self.phase = LifecyclePhase::DevicesReady;

        if let Some(setfiles) = &config.run_setfiles {
            let destinations = callbacks::setfiles_destinations(&config.mounts, &root);
            if !destinations.is_empty() {
                let (setfiles, setfiles_root) = (setfiles.clone(), root.clone());
                hook_callbacks
                    .entry(HookEvent::PreChroot)
                    .or_default()
                    .push(in_mount_namespace(move || {
                        callbacks::run_setfiles(&setfiles, &setfiles_root, &destinations)
                    }));
            }
        }

        let cpu = config.cpu;
        if cpu.shares != 0 {
            cgroup.set_cpu_shares(cpu.shares)?;
        }
        if cpu.period != 0 {
            cgroup.set_cpu_quota(cpu.quota, cpu.period)?;
        }
        if cpu.rt_period != 0 {
            cgroup.set_cpu_rt(cpu.rt_runtime, cpu.rt_period)?;
        }
        self.phase = LifecyclePhase::CgroupReady;

        self.pid_file = config
            .pid_file
            .clone()
            .or_else(|| self.runfs.as_ref().map(|runfs| runfs.join(CONTAINER_PID_FILENAME)));
        if let Some(pid_file) = &self.pid_file {
            jail.write_pid_file(pid_file);
        }

        jail.namespace(Namespace::Ipc);
        jail.namespace(Namespace::Mount);
        if !config.share_host_netns {
            jail.namespace(Namespace::Net);
        }
        jail.namespace(Namespace::Pid);
        jail.namespace(Namespace::User);
        if !running_as_root {
            jail.disable_setgroups();
        }
        jail.namespace(Namespace::Cgroup);
        jail.id_maps(config.uid_map.clone(), config.gid_map.clone());

        let _ = config.uid_map.outside_id(config.uid)?;
        if config.uid > 0 {
            jail.change_uid(Uid::from_raw(config.uid));
        }
        let _ = config.gid_map.outside_id(config.gid)?;
        if config.gid > 0 {
            jail.change_gid(Gid::from_raw(config.gid));
        }

        jail.enter_pivot_root(&root);
        for tasks in cgroup.task_paths() {
            jail.add_to_cgroup(&tasks);
        }
        if let Some(table) = &config.alt_syscall_table {
            jail.use_alt_syscall(table)?;
        }
        for rlimit in &config.rlimits {
            jail.add_rlimit(*rlimit)?;
        }

        if let Some(context) = &config.selinux_context {
            jail.add_hook(HookEvent::PreExecve, callbacks::selinux_exec_hook(context));
        }
        if let Some(hook) = &config.pre_execve_hook {
            let hook = Arc::clone(hook);
            jail.add_hook(HookEvent::PreExecve, Box::new(move || hook()));
        }

        for (event, cbs) in &config.hooks {
            hook_callbacks
                .entry(*event)
                .or_default()
                .extend(cbs.iter().cloned());
        }
        self.hook_states = Vec::with_capacity(HookEvent::ORDER.len());
        for event in HookEvent::ORDER {
            let Some(cbs) = hook_callbacks.remove(&event) else {
                continue;
            };
            let mut state = HookState::new()?;
            state.install_hook(&mut jail, event)?;
            self.hook_states.push((state, cbs));
        }

        for fd in &config.inherited_fds {
            jail.preserve_fd(*fd, *fd);
        }
        jail.skip_remount_private();
        if !config.keep_fds_open {
            jail.close_open_fds();
        }
        if let Some((mask, ambient)) = config.capmask {
            jail.use_caps(CapabilityConfig {
                mask,
                ambient,
                securebits_skip: config.securebits_skip_mask,
            });
        }
        jail.run_as_init(config.run_as_init);

        let jail = self.jail.insert(jail);
        let pid = jail.spawn(&config.program_argv)?;
        self.init_pid = Some(pid);
        self.phase = LifecyclePhase::JailStarted;

        for (state, cbs) in &mut self.hook_states {
            state.wait_for_hook_and_run(cbs, pid)?;
        }

        self.phase = LifecyclePhase::Running;
        tracing::info!(name = %self.name, %pid, root = %root.display(), "container started");
        Ok(())
    }

    /// Creates `<rundir>/<name>_XXXXXX` and bind-mounts the rootfs on its
    /// `root` subdirectory. Returns the path of `root`.
    fn mount_runfs(&mut self, config: &ContainerConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.rundir).map_err(|e| VesselError::io(&self.rundir, e))?;
        let template = self.rundir.join(format!("{}_XXXXXX", self.name));
        let runfs = nix::unistd::mkdtemp(&template)
            .map_err(|e| VesselError::io(&template, std::io::Error::from(e)))?;
        self.runfs = Some(runfs.clone());

        let uid = Uid::from_raw(config.uid_map.outside_id(config.uid)?);
        let gid = Gid::from_raw(config.gid_map.outside_id(config.gid)?);
        // The container user needs to reach its root through the runfs.
        mount::make_dir(&runfs, uid, gid, 0o700)?;

        let root = runfs.join("root");
        std::fs::create_dir(&root).map_err(|e| VesselError::io(&root, e))?;
        self.runfsroot = Some(root.clone());
        std::fs::set_permissions(
            &root,
            std::os::unix::fs::PermissionsExt::from_mode(RUNFS_ROOT_MODE),
        )
        .map_err(|e| VesselError::io(&root, e))?;

        let rootfs_failed = |e: VesselError| VesselError::MountFailed {
            name: "rootfs".into(),
            message: e.to_string(),
        };
        let flags = config.rootfs_mount_flags;
        mount::mount_external(
            &config.rootfs,
            &root,
            None,
            MsFlags::MS_BIND | (flags & MsFlags::MS_REC),
            None,
        )
        .map_err(rootfs_failed)?;
        self.runfsroot_mounted = true;

        // A bind mount ignores every flag but MS_REC; apply the rest with a
        // remount.
        if !flags.is_empty() {
            mount::mount_external(&config.rootfs, &root, None, flags - MsFlags::MS_REC, None)
                .map_err(rootfs_failed)?;
        }
        tracing::debug!(runfs = %runfs.display(), rootfs = %config.rootfs.display(), "runfs mounted");
        Ok(root)
    }

    fn abort_start(&mut self) {
        if let Some(jail) = self.jail.as_mut() {
            if jail.pid().is_some() {
                let _ = jail.kill();
                let _ = jail.wait();
            }
        }
        self.hook_states.clear();
        if !self.teardown() {
            tracing::warn!(name = %self.name, "teardown after failed start was incomplete");
        }
        self.init_pid = None;
    }

    /// Releases every host resource the container holds: external mounts,
    /// loop devices, verity targets, the cgroup, the runfs and the pid file.
    ///
    /// Each step is attempted even if an earlier one failed. Returns `true`
    /// if everything was released; a second call is a no-op.
    pub fn teardown(&mut self) -> bool {
        let mut ok = self.mounts.unmount_all();

        if let Some(mut cgroup) = self.cgroup.take() {
            ok &= cgroup.destroy();
        }

        if self.runfs.is_some() {
            if let Some(root) = self.runfsroot.take() {
                // The rootfs may be mounted recursively; detaching takes the
                // whole tree down at once.
                if self.runfsroot_mounted {
                    if let Err(e) = mount::unmount_detached(&root) {
                        tracing::error!(path = %root.display(), error = %e, "failed to detach rootfs");
                        ok = false;
                    }
                    self.runfsroot_mounted = false;
                }
                if let Err(e) = std::fs::remove_dir(&root) {
                    tracing::error!(path = %root.display(), error = %e, "failed to remove runfs root");
                    ok = false;
                }
            }
        }
        self.runfsroot = None;

        if let Some(pid_file) = self.pid_file.take() {
            match std::fs::remove_file(&pid_file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(path = %pid_file.display(), error = %e, "failed to remove pid file");
                    ok = false;
                }
            }
        }

        if let Some(runfs) = self.runfs.take() {
            if let Err(e) = std::fs::remove_dir(&runfs) {
                tracing::error!(path = %runfs.display(), error = %e, "failed to remove runfs");
                ok = false;
            }
        }

        self.phase = LifecyclePhase::TornDown;
        ok
    }

    /// Waits for the init process to exit, then tears the container down.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::InvalidState`] if the container was never
    /// started, [`VesselError::JailFailed`] if the process was reaped
    /// elsewhere so its status is unknown, or if teardown was incomplete.
    /// Teardown is attempted in every case but the first.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        let jail = self.jail.as_mut().ok_or_else(|| VesselError::InvalidState {
            message: format!("container {} was not started", self.name),
        })?;
        let waited = jail.wait();
        self.phase = LifecyclePhase::Exited;
        let torn_down = self.teardown();

        let status = waited?.ok_or_else(|| VesselError::JailFailed {
            message: format!("init process of {} was reaped elsewhere", self.name),
        })?;
        if !torn_down {
            return Err(VesselError::InvalidState {
                message: format!("container {} exited with {} but teardown failed", self.name, status.code()),
            });
        }
        tracing::info!(name = %self.name, code = status.code(), "container exited");
        Ok(status)
    }

    /// Sends `SIGKILL` to the init process and waits for it.
    ///
    /// # Errors
    ///
    /// Same as [`Container::wait`], plus the `kill(2)` error.
    pub fn kill(&mut self) -> Result<ExitStatus> {
        let jail = self.jail.as_mut().ok_or_else(|| VesselError::InvalidState {
            message: format!("container {} was not started", self.name),
        })?;
        jail.kill()?;
        self.wait()
    }

    /// Leaves the running container behind: its cgroup and runfs stay in
    /// place and nothing is torn down.
    pub fn detach(mut self) {
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.release();
        }
        tracing::debug!(name = %self.name, pid = ?self.init_pid, "container detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rootfs: &Path) -> ContainerConfig {
        let mut cfg = ContainerConfig::new();
        cfg.rootfs(rootfs);
        cfg.program_argv(&["/bin/true"]).expect("argv");
        // Container root is the current user, so the runfs can be chowned
        // without privileges.
        cfg.uid_map(&format!("0 {} 1", Uid::current())).expect("uid map");
        cfg.gid_map(&format!("0 {} 1", Gid::current())).expect("gid map");
        cfg
    }

    #[test]
    fn new_container_has_no_pid_or_root() {
        let c = Container::new("test", Path::new("/tmp"));
        assert_eq!(c.name(), "test");
        assert_eq!(c.pid(), None);
        assert_eq!(c.root(), None);
        assert_eq!(c.phase(), LifecyclePhase::Created);
        let shown = format!("{c:?}");
        assert!(shown.starts_with("Container") && shown.contains("\"test\""));
    }

    #[test]
    fn wait_and_kill_before_start_are_rejected() {
        let mut c = Container::new("test", Path::new("/tmp"));
        assert!(matches!(c.wait(), Err(VesselError::InvalidState { .. })));
        assert!(matches!(c.kill(), Err(VesselError::InvalidState { .. })));
    }

    #[test]
    fn teardown_of_unstarted_container_is_idempotent() {
        let mut c = Container::new("test", Path::new("/tmp"));
        assert!(c.teardown());
        assert!(c.teardown());
        assert_eq!(c.phase(), LifecyclePhase::TornDown);
    }

    #[test]
    fn empty_program_is_rejected() {
        let rundir = tempfile::tempdir().expect("rundir");
        let mut c = Container::new("test", rundir.path());
        let err = c.start(&ContainerConfig::new()).expect_err("no program");
        assert!(matches!(err, VesselError::ConfigInvalid { .. }));
        assert_eq!(c.phase(), LifecyclePhase::Created);
    }

    #[test]
    fn failed_start_leaves_rundir_empty() {
        let rundir = tempfile::tempdir().expect("rundir");
        let mut c = Container::new("test", rundir.path());
        let err = c
            .start(&config(Path::new("/nonexistent/vessel/rootfs")))
            .expect_err("missing rootfs");
        assert!(matches!(err, VesselError::MountFailed { ref name, .. } if name == "rootfs"));
        assert_eq!(c.pid(), None);
        assert_eq!(c.root(), None);
        let left: Vec<_> = std::fs::read_dir(rundir.path()).expect("read rundir").collect();
        assert!(left.is_empty());
    }

    #[test]
    fn failed_start_cannot_be_retried() {
        let rundir = tempfile::tempdir().expect("rundir");
        let mut c = Container::new("test", rundir.path());
        let cfg = config(Path::new("/nonexistent/vessel/rootfs"));
        assert!(c.start(&cfg).is_err());
        assert!(matches!(c.start(&cfg), Err(VesselError::InvalidState { .. })));
    }

    #[test]
    #[ignore = "requires root"]
    fn runs_program_and_tears_down() {
        let rundir = tempfile::tempdir().expect("rundir");
        let cgroups = tempfile::tempdir().expect("cgroup root");
        let mut c = Container::new("vessel-test", rundir.path());
        c.set_cgroup_root(cgroups.path());
        let mut cfg = ContainerConfig::new();
        cfg.rootfs(Path::new("/"));
        cfg.program_argv(&["/bin/true"]).expect("argv");
        cfg.share_host_netns();
        c.start(&cfg).expect("start");
        let runfs = c.root().expect("runfs").to_path_buf();
        assert!(runfs.join(CONTAINER_PID_FILENAME).is_file());

        assert_eq!(c.wait().expect("wait"), ExitStatus::Exited(0));
        assert!(!runfs.exists());
        assert_eq!(c.phase(), LifecyclePhase::TornDown);
    }

    #[test]
    fn failed_wait_still_tears_down() {
        let rundir = tempfile::tempdir().expect("rundir");
        let runfs = rundir.path().join("test_abcdef");
        std::fs::create_dir(&runfs).expect("runfs");
        let mut c = Container::new("test", rundir.path());
        // A jail that never spawned makes waitpid impossible.
        c.jail = Some(Jail::new());
        c.runfs = Some(runfs.clone());

        assert!(matches!(c.wait(), Err(VesselError::InvalidState { .. })));
        assert!(!runfs.exists());
        assert_eq!(c.phase(), LifecyclePhase::TornDown);
    }

    /// Writable overlay of the host root, unmounted on drop. Upper and work
    /// directories live on their own tmpfs so they do not overlap `/`.
    struct HostOverlay {
        merged: PathBuf,
        dir: tempfile::TempDir,
    }

    impl HostOverlay {
        fn mount() -> Self {
            let dir = tempfile::tempdir().expect("overlay dir");
            nix::mount::mount(
                Some("tmpfs"),
                dir.path(),
                Some("tmpfs"),
                MsFlags::empty(),
                None::<&str>,
            )
            .expect("mount tmpfs");
            let (upper, work, merged) =
                (dir.path().join("upper"), dir.path().join("work"), dir.path().join("merged"));
            for d in [&upper, &work, &merged] {
                std::fs::create_dir(d).expect("overlay subdir");
            }
            let data = format!("lowerdir=/,upperdir={},workdir={}", upper.display(), work.display());
            nix::mount::mount(
                Some("overlay"),
                &merged,
                Some("overlay"),
                MsFlags::empty(),
                Some(data.as_str()),
            )
            .expect("mount overlay");
            Self { merged, dir }
        }
    }

    impl Drop for HostOverlay {
        fn drop(&mut self) {
            let _ = mount::unmount_detached(&self.merged);
            let _ = mount::unmount_detached(self.dir.path());
        }
    }

    #[test]
    #[ignore = "requires root"]
    fn bind_mount_is_gone_after_wait() {
        use vessel_common::constants::PROC_SELF_MOUNTS;
        use vessel_core::filesystem::mountinfo::mountpoints_under;

        use crate::config::MountSpec;

        let rundir = tempfile::tempdir().expect("rundir");
        let cgroups = tempfile::tempdir().expect("cgroup root");
        let src = tempfile::tempdir().expect("bind source");
        let rootfs = HostOverlay::mount();

        let mut cfg = ContainerConfig::new();
        cfg.rootfs(&rootfs.merged);
        cfg.program_argv(&["/bin/true"]).expect("argv");
        cfg.uid_map("0 0 1").expect("uid map");
        cfg.gid_map("0 0 1").expect("gid map");
        cfg.share_host_netns();
        cfg.add_mount(MountSpec {
            name: "dst".into(),
            source: src.path().to_path_buf(),
            destination: PathBuf::from("/dst"),
            fstype: "bind".into(),
            data: None,
            verity: None,
            flags: MsFlags::MS_BIND,
            uid: 0,
            gid: 0,
            mode: 0o755,
            mount_in_ns: false,
            create: true,
            loopback: false,
        })
        .expect("mount");

        let rundir_path = std::fs::canonicalize(rundir.path()).expect("canonical rundir");
        let mut c = Container::new("vessel-bind", &rundir_path);
        c.set_cgroup_root(cgroups.path());
        c.start(&cfg).expect("start");
        let runfs = c.root().expect("runfs").to_path_buf();
        let dst = runfs.join("root/dst");
        let mounts = Path::new(PROC_SELF_MOUNTS);
        assert!(mountpoints_under(&runfs, mounts).expect("mounts").contains(&dst));

        assert_eq!(c.wait().expect("wait"), ExitStatus::Exited(0));
        assert!(mountpoints_under(&runfs, mounts).expect("mounts").is_empty());
        assert!(!runfs.exists());
    }
}

