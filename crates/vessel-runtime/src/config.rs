//! Container configuration.
//!
//! [`ContainerConfig`] is built once through setters, each of which checks
//! its own argument, and is then only read by
//! [`crate::container::Container::start`].

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::MsFlags;
use nix::unistd::Pid;

use vessel_common::constants::MAX_RLIMITS;
use vessel_common::error::{Result, VesselError};
use vessel_core::cgroup::devices::{DeviceAccess, DeviceRule, DeviceType};
use vessel_core::jail::{HookEvent, Rlimit};
use vessel_core::namespace::user::IdMap;

/// Callback run by the supervisor while the jailed process is parked at a
/// [`HookEvent`]. Receives the pid of the jailed process.
pub type HookCallback = Arc<dyn Fn(Pid) -> Result<()> + Send + Sync>;

/// Callback run inside the jailed process right before `execve(2)`.
pub type PreExecveHook = Arc<dyn Fn() -> std::io::Result<()> + Send + Sync>;

/// One entry of the mount table.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Name used in error messages.
    pub name: String,
    /// Source path. Relative bind sources resolve against the container
    /// root, relative loopback sources against the config root.
    pub source: PathBuf,
    /// Destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type.
    pub fstype: String,
    /// Filesystem-specific mount data.
    pub data: Option<String>,
    /// dm-verity parameters.
    pub verity: Option<String>,
    /// Mount flags.
    pub flags: MsFlags,
    /// Owner of a created destination, inside the container.
    pub uid: u32,
    /// Group of a created destination, inside the container.
    pub gid: u32,
    /// Mode of a created destination.
    pub mode: u32,
    /// Mount inside the new mount namespace rather than from the supervisor.
    pub mount_in_ns: bool,
    /// Create the destination if it is missing.
    pub create: bool,
    /// Attach the source to a loop device first.
    pub loopback: bool,
}

/// A device node to create in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Block or character.
    pub kind: DeviceType,
    /// Path inside the container.
    pub path: PathBuf,
    /// Permission bits.
    pub mode: u32,
    /// Major number.
    pub major: u32,
    /// Minor number, or `-1` together with `copy_minor`.
    pub minor: i32,
    /// Take the minor number from the host node at `path`.
    pub copy_minor: bool,
    /// Owner, inside the container.
    pub uid: u32,
    /// Group, inside the container.
    pub gid: u32,
}

/// CPU controller parameters. Zero means "leave unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuParams {
    /// `cpu.shares`.
    pub shares: u64,
    /// `cpu.cfs_quota_us`; `-1` for unlimited.
    pub quota: i64,
    /// `cpu.cfs_period_us`.
    pub period: u64,
    /// `cpu.rt_runtime_us`.
    pub rt_runtime: u64,
    /// `cpu.rt_period_us`.
    pub rt_period: u64,
}

/// Everything needed to start one container.
#[derive(Clone)]
pub struct ContainerConfig {
    pub(crate) config_root: Option<PathBuf>,
    pub(crate) rootfs: PathBuf,
    pub(crate) rootfs_mount_flags: MsFlags,
    pub(crate) premounted_runfs: Option<PathBuf>,
    pub(crate) pid_file: Option<PathBuf>,
    pub(crate) program_argv: Vec<String>,
    pub(crate) uid: u32,
    pub(crate) uid_map: IdMap,
    pub(crate) gid: u32,
    pub(crate) gid_map: IdMap,
    pub(crate) alt_syscall_table: Option<String>,
    pub(crate) mounts: Vec<MountSpec>,
    pub(crate) devices: Vec<DeviceSpec>,
    pub(crate) cgroup_devices: Vec<DeviceRule>,
    pub(crate) run_setfiles: Option<PathBuf>,
    pub(crate) cpu: CpuParams,
    pub(crate) cgroup_parent: Option<String>,
    pub(crate) cgroup_owner: u32,
    pub(crate) cgroup_group: u32,
    pub(crate) share_host_netns: bool,
    pub(crate) keep_fds_open: bool,
    pub(crate) rlimits: Vec<Rlimit>,
    pub(crate) capmask: Option<(u64, bool)>,
    pub(crate) securebits_skip_mask: u64,
    pub(crate) run_as_init: bool,
    pub(crate) selinux_context: Option<String>,
    pub(crate) pre_execve_hook: Option<PreExecveHook>,
    pub(crate) inherited_fds: Vec<RawFd>,
    pub(crate) hooks: BTreeMap<HookEvent, Vec<HookCallback>>,
}

impl std::fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("rootfs", &self.rootfs)
            .field("program_argv", &self.program_argv)
            .field("uid_map", &self.uid_map.to_string())
            .field("gid_map", &self.gid_map.to_string())
            .field("mounts", &self.mounts.len())
            .field("devices", &self.devices.len())
            .field("cpu", &self.cpu)
            .field("hooks", &self.hooks.values().map(Vec::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerConfig {
    /// Creates an empty configuration. The program runs as pid 1 of its pid
    /// namespace unless [`ContainerConfig::set_run_as_init`] says otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_root: None,
            rootfs: PathBuf::new(),
            rootfs_mount_flags: MsFlags::empty(),
            premounted_runfs: None,
            pid_file: None,
            program_argv: Vec::new(),
            uid: 0,
            uid_map: IdMap::default(),
            gid: 0,
            gid_map: IdMap::default(),
            alt_syscall_table: None,
            mounts: Vec::new(),
            devices: Vec::new(),
            cgroup_devices: Vec::new(),
            run_setfiles: None,
            cpu: CpuParams::default(),
            cgroup_parent: None,
            cgroup_owner: 0,
            cgroup_group: 0,
            share_host_netns: false,
            keep_fds_open: false,
            rlimits: Vec::new(),
            capmask: None,
            securebits_skip_mask: 0,
            run_as_init: true,
            selinux_context: None,
            pre_execve_hook: None,
            inherited_fds: Vec::new(),
            hooks: BTreeMap::new(),
        }
    }

    /// Directory relative loopback sources are resolved against.
    pub fn config_root(&mut self, path: &Path) {
        self.config_root = Some(path.to_path_buf());
    }

    /// Directory bind-mounted as the container's root.
    pub fn rootfs(&mut self, path: &Path) {
        self.rootfs = path.to_path_buf();
    }

    /// Flags applied to the rootfs bind mount. `MS_BIND | MS_REMOUNT` is
    /// always added since the rootfs is remounted after the bind.
    pub fn rootfs_mount_flags(&mut self, flags: MsFlags) {
        self.rootfs_mount_flags = flags | MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
    }

    /// Uses an already prepared root directory instead of bind-mounting the
    /// rootfs into a fresh runfs.
    pub fn premounted_runfs(&mut self, path: &Path) {
        self.premounted_runfs = Some(path.to_path_buf());
    }

    /// Where the jailed process's pid is written.
    pub fn pid_file(&mut self, path: &Path) {
        self.pid_file = Some(path.to_path_buf());
    }

    /// Program and arguments run in the container.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if `argv` is empty.
    pub fn program_argv<S: AsRef<str>>(&mut self, argv: &[S]) -> Result<()> {
        if argv.is_empty() {
            return Err(VesselError::config("program argv must not be empty"));
        }
        self.program_argv = argv.iter().map(|a| a.as_ref().to_owned()).collect();
        Ok(())
    }

    /// UID the program runs as inside the container. 0 leaves it unchanged.
    pub const fn set_uid(&mut self, uid: u32) {
        self.uid = uid;
    }

    /// GID the program runs as inside the container. 0 leaves it unchanged.
    pub const fn set_gid(&mut self, gid: u32) {
        self.gid = gid;
    }

    /// UID map, as comma-separated `inside outside count` triples.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if the map is malformed.
    pub fn uid_map(&mut self, map: &str) -> Result<()> {
        self.uid_map = IdMap::parse(map)?;
        Ok(())
    }

    /// GID map, in the same format as [`ContainerConfig::uid_map`].
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if the map is malformed.
    pub fn gid_map(&mut self, map: &str) -> Result<()> {
        self.gid_map = IdMap::parse(map)?;
        Ok(())
    }

    /// Alternate syscall table for the program.
    pub fn alt_syscall_table(&mut self, table: &str) {
        self.alt_syscall_table = Some(table.to_owned());
    }

    /// Adds a resource limit.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] once
    /// [`MAX_RLIMITS`] limits are configured.
    pub fn add_rlimit(&mut self, resource: i32, cur: u64, max: u64) -> Result<()> {
        if self.rlimits.len() >= MAX_RLIMITS {
            return Err(VesselError::config(format!(
                "at most {MAX_RLIMITS} rlimits are supported"
            )));
        }
        self.rlimits.push(Rlimit { resource, cur, max });
        Ok(())
    }

    /// Appends a mount. Mounts are performed in the order added.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if the name, source,
    /// destination or type is empty.
    pub fn add_mount(&mut self, mount: MountSpec) -> Result<()> {
        if mount.name.is_empty()
            || mount.source.as_os_str().is_empty()
            || mount.destination.as_os_str().is_empty()
            || mount.fstype.is_empty()
        {
            return Err(VesselError::config(format!(
                "mount '{}' needs a name, source, destination and type",
                mount.name
            )));
        }
        self.mounts.push(mount);
        Ok(())
    }

    /// Appends a cgroup device rule. Rules apply in order, later ones
    /// overriding earlier ones.
    pub fn add_cgroup_device(&mut self, rule: DeviceRule) {
        self.cgroup_devices.push(rule);
    }

    /// Adds a device node. Non-empty `access` also allows the device in the
    /// cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if the path is empty, or
    /// `copy_minor` is set with a minor other than `-1`.
    pub fn add_device(&mut self, device: DeviceSpec, access: DeviceAccess) -> Result<()> {
        if device.path.as_os_str().is_empty() {
            return Err(VesselError::config("device path must not be empty"));
        }
        if device.copy_minor && device.minor != -1 {
            return Err(VesselError::config(format!(
                "device {}: minor must be -1 when copying it from the host",
                device.path.display()
            )));
        }
        if !access.is_empty() {
            let major = i32::try_from(device.major).map_err(|_| {
                VesselError::config(format!("device major {} out of range", device.major))
            })?;
            self.add_cgroup_device(DeviceRule::from_raw(
                true,
                device.kind,
                major,
                device.minor,
                access,
            )?);
        }
        self.devices.push(device);
        Ok(())
    }

    /// Runs `command` over the writable external mounts, inside the
    /// container's mount namespace, to label them.
    pub fn run_setfiles(&mut self, command: &Path) {
        self.run_setfiles = Some(command.to_path_buf());
    }

    /// Sets `cpu.shares`.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] for values below 2.
    pub fn set_cpu_shares(&mut self, shares: u64) -> Result<()> {
        if shares < 2 {
            return Err(VesselError::config(format!(
                "cpu shares must be at least 2, got {shares}"
            )));
        }
        self.cpu.shares = shares;
        Ok(())
    }

    /// Sets the CFS bandwidth. `quota` may exceed `period` to use more than
    /// one CPU, or be `-1` for no limit.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if `quota` is not positive or
    /// `-1`, or `period` is not positive.
    pub fn set_cpu_cfs_params(&mut self, quota: i64, period: i64) -> Result<()> {
        if quota <= 0 && quota != -1 {
            return Err(VesselError::config(format!("invalid cpu quota {quota}")));
        }
        let period = u64::try_from(period)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| VesselError::config(format!("invalid cpu period {period}")))?;
        self.cpu.quota = quota;
        self.cpu.period = period;
        Ok(())
    }

    /// Sets the realtime budget. A zero runtime keeps the cgroup off the
    /// realtime scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] unless
    /// `0 <= rt_runtime < rt_period`.
    pub fn set_cpu_rt_params(&mut self, rt_runtime: i64, rt_period: i64) -> Result<()> {
        if rt_runtime < 0 || rt_runtime >= rt_period {
            return Err(VesselError::config(format!(
                "invalid realtime params {rt_runtime}/{rt_period}"
            )));
        }
        self.cpu.rt_runtime = rt_runtime.unsigned_abs();
        self.cpu.rt_period = rt_period.unsigned_abs();
        Ok(())
    }

    /// Creates the cgroup under `parent`, owned by `owner`/`group` as seen
    /// inside the container.
    pub fn set_cgroup_parent(&mut self, parent: &str, owner: u32, group: u32) {
        self.cgroup_parent = Some(parent.to_owned());
        self.cgroup_owner = owner;
        self.cgroup_group = group;
    }

    /// Keeps the host network namespace.
    pub const fn share_host_netns(&mut self) {
        self.share_host_netns = true;
    }

    /// Leaves inherited descriptors open in the program.
    pub const fn keep_fds_open(&mut self) {
        self.keep_fds_open = true;
    }

    /// Restricts the program to the capabilities in `mask`, optionally
    /// raising them into the ambient set.
    pub const fn set_capmask(&mut self, mask: u64, ambient: bool) {
        self.capmask = Some((mask, ambient));
    }

    /// Securebits left unlocked when capabilities are restricted.
    pub const fn set_securebits_skip_mask(&mut self, mask: u64) {
        self.securebits_skip_mask = mask;
    }

    /// With `false`, a minimal init becomes pid 1 and the program its child.
    pub const fn set_run_as_init(&mut self, run_as_init: bool) {
        self.run_as_init = run_as_init;
    }

    /// SELinux context the program is executed under.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if `context` is empty.
    pub fn set_selinux_context(&mut self, context: &str) -> Result<()> {
        if context.is_empty() {
            return Err(VesselError::config("selinux context must not be empty"));
        }
        self.selinux_context = Some(context.to_owned());
        Ok(())
    }

    /// Runs `hook` in the jailed process right before `execve(2)`.
    pub fn set_pre_execve_hook(&mut self, hook: PreExecveHook) {
        self.pre_execve_hook = Some(hook);
    }

    /// Runs `callback` in the supervisor when the jailed process reaches
    /// `event`, after the callbacks added before it.
    pub fn add_hook(&mut self, event: HookEvent, callback: HookCallback) {
        self.hooks.entry(event).or_default().push(callback);
    }

    /// Descriptors passed through to the program unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::ConfigInvalid`] if descriptors were already
    /// set.
    pub fn inherit_fds(&mut self, fds: &[RawFd]) -> Result<()> {
        if !self.inherited_fds.is_empty() {
            return Err(VesselError::config("inherited fds are already set"));
        }
        self.inherited_fds = fds.to_vec();
        Ok(())
    }

    /// Program and arguments.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.program_argv
    }

    /// Mount table, in order.
    #[must_use]
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Device nodes to create.
    #[must_use]
    pub fn devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    /// Cgroup device rules, in order.
    #[must_use]
    pub fn cgroup_devices(&self) -> &[DeviceRule] {
        &self.cgroup_devices
    }

    /// CPU controller parameters.
    #[must_use]
    pub const fn cpu_params(&self) -> CpuParams {
        self.cpu
    }

    /// Configured resource limits.
    #[must_use]
    pub fn rlimits(&self) -> &[Rlimit] {
        &self.rlimits
    }

    /// Flags for the rootfs bind mount.
    #[must_use]
    pub const fn rootfs_flags(&self) -> MsFlags {
        self.rootfs_mount_flags
    }

    /// Container UID.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// Container GID.
    #[must_use]
    pub const fn gid(&self) -> u32 {
        self.gid
    }

    /// Cgroup parent directory, if any.
    #[must_use]
    pub fn cgroup_parent(&self) -> Option<&str> {
        self.cgroup_parent.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(minor: i32, copy_minor: bool) -> DeviceSpec {
        DeviceSpec {
            kind: DeviceType::Char,
            path: PathBuf::from("/dev/null"),
            mode: 0o666,
            major: 1,
            minor,
            copy_minor,
            uid: 0,
            gid: 0,
        }
    }

    #[test]
    fn new_config_runs_program_as_init() {
        let cfg = ContainerConfig::new();
        assert!(cfg.run_as_init);
        assert!(cfg.argv().is_empty());
    }

    #[test]
    fn cpu_shares_below_two_are_rejected() {
        let mut cfg = ContainerConfig::new();
        assert!(cfg.set_cpu_shares(0).is_err());
        assert!(cfg.set_cpu_shares(1).is_err());
        cfg.set_cpu_shares(2).expect("two shares");
        assert_eq!(cfg.cpu_params().shares, 2);
    }

    #[test]
    fn cfs_quota_accepts_unlimited() {
        let mut cfg = ContainerConfig::new();
        cfg.set_cpu_cfs_params(-1, 100_000).expect("unlimited");
        cfg.set_cpu_cfs_params(200_000, 100_000).expect("two cpus");
        assert!(cfg.set_cpu_cfs_params(0, 100_000).is_err());
        assert!(cfg.set_cpu_cfs_params(-2, 100_000).is_err());
        assert!(cfg.set_cpu_cfs_params(50_000, 0).is_err());
        assert_eq!(cfg.cpu_params().quota, 200_000);
        assert_eq!(cfg.cpu_params().period, 100_000);
    }

    #[test]
    fn rt_runtime_must_be_below_period() {
        let mut cfg = ContainerConfig::new();
        cfg.set_cpu_rt_params(0, 1_000_000).expect("no realtime");
        cfg.set_cpu_rt_params(950_000, 1_000_000).expect("realtime");
        assert!(cfg.set_cpu_rt_params(-1, 1_000_000).is_err());
        assert!(cfg.set_cpu_rt_params(1_000_000, 1_000_000).is_err());
    }

    #[test]
    fn rlimits_are_rejected_past_the_maximum() {
        let mut cfg = ContainerConfig::new();
        for _ in 0..MAX_RLIMITS {
            cfg.add_rlimit(libc::RLIMIT_NOFILE as i32, 1024, 4096)
                .expect("rlimit");
        }
        assert!(matches!(
            cfg.add_rlimit(libc::RLIMIT_NOFILE as i32, 1024, 4096),
            Err(VesselError::ConfigInvalid { .. })
        ));
        assert_eq!(cfg.rlimits().len(), MAX_RLIMITS);
    }

    #[test]
    fn copy_minor_requires_wildcard_minor() {
        let mut cfg = ContainerConfig::new();
        assert!(cfg.add_device(device(3, true), DeviceAccess::default()).is_err());
        cfg.add_device(device(-1, true), DeviceAccess::default())
            .expect("copied minor");
        cfg.add_device(device(3, false), DeviceAccess::default())
            .expect("fixed minor");
        assert_eq!(cfg.devices().len(), 2);
    }

    #[test]
    fn device_access_adds_allow_rule() {
        let mut cfg = ContainerConfig::new();
        cfg.add_device(device(3, false), DeviceAccess::ALL).expect("device");
        let rules = cfg.cgroup_devices();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].allow);
        assert_eq!(rules[0].to_cgroup_line(), "c 1:3 rwm");
    }

    #[test]
    fn empty_argv_is_rejected() {
        let mut cfg = ContainerConfig::new();
        assert!(cfg.program_argv::<&str>(&[]).is_err());
        cfg.program_argv(&["/bin/true"]).expect("argv");
        assert_eq!(cfg.argv(), ["/bin/true"]);
    }

    #[test]
    fn inherited_fds_are_set_once() {
        let mut cfg = ContainerConfig::new();
        cfg.inherit_fds(&[3, 4]).expect("first");
        assert!(cfg.inherit_fds(&[5]).is_err());
    }

    #[test]
    fn rootfs_flags_always_bind_and_remount() {
        let mut cfg = ContainerConfig::new();
        assert!(cfg.rootfs_flags().is_empty());
        cfg.rootfs_mount_flags(MsFlags::MS_RDONLY);
        assert_eq!(
            cfg.rootfs_flags(),
            MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT | MsFlags::MS_BIND
        );
    }

    #[test]
    fn malformed_id_map_is_rejected() {
        let mut cfg = ContainerConfig::new();
        assert!(cfg.uid_map("0 1000").is_err());
        cfg.gid_map("0 1000 1,1 100000 1000").expect("gid map");
    }

    #[test]
    fn mounts_need_all_paths() {
        let mut cfg = ContainerConfig::new();
        let mount = MountSpec {
            name: "data".into(),
            source: PathBuf::from("/tmp/src"),
            destination: PathBuf::new(),
            fstype: "bind".into(),
            data: None,
            verity: None,
            flags: MsFlags::MS_BIND,
            uid: 0,
            gid: 0,
            mode: 0o750,
            mount_in_ns: false,
            create: true,
            loopback: false,
        };
        assert!(cfg.add_mount(mount.clone()).is_err());
        cfg.add_mount(MountSpec {
            destination: PathBuf::from("/dst"),
            ..mount
        })
        .expect("mount");
        assert_eq!(cfg.mounts().len(), 1);
    }

    #[test]
    fn hooks_keep_insertion_order_per_event() {
        let mut cfg = ContainerConfig::new();
        cfg.add_hook(HookEvent::PreExecve, Arc::new(|_| Ok(())));
        cfg.add_hook(HookEvent::PreChroot, Arc::new(|_| Ok(())));
        cfg.add_hook(HookEvent::PreExecve, Arc::new(|_| Ok(())));
        assert_eq!(cfg.hooks[&HookEvent::PreExecve].len(), 2);
        assert_eq!(cfg.hooks.keys().next(), Some(&HookEvent::PreChroot));
    }
}
