//! Cgroups v1 resource management.
//!
//! Each container gets one directory per mounted subsystem at
//! `<cgroup_root>/<subsystem>/<parent>/<name>`. Subsystems whose hierarchy
//! is not mounted are skipped. The directories are removed when the
//! [`Cgroup`] is destroyed or dropped.

pub mod cpu;
pub mod devices;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Pid, Uid, chown};

use vessel_common::error::{Result, VesselError};

use self::devices::{DevicePolicy, DeviceRule, DeviceType};

/// A v1 cgroup subsystem the runtime manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CgroupSubsystem {
    /// CPU bandwidth.
    Cpu,
    /// CPU accounting.
    Cpuacct,
    /// CPU and memory node placement.
    Cpuset,
    /// Device access.
    Devices,
    /// Freezing.
    Freezer,
    /// Scheduler boosting.
    Schedtune,
}

impl CgroupSubsystem {
    /// Every managed subsystem.
    pub const ALL: [Self; 6] = [
        Self::Cpu,
        Self::Cpuacct,
        Self::Cpuset,
        Self::Devices,
        Self::Freezer,
        Self::Schedtune,
    ];

    /// Hierarchy directory name under the cgroup root.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Devices => "devices",
            Self::Freezer => "freezer",
            Self::Schedtune => "schedtune",
        }
    }
}

impl fmt::Display for CgroupSubsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to the cgroup directories of one container.
#[derive(Debug)]
pub struct Cgroup {
    name: String,
    paths: BTreeMap<CgroupSubsystem, PathBuf>,
    policy: DevicePolicy,
}

impl Cgroup {
    /// Creates the cgroup directories for `name`.
    ///
    /// `owner` is applied to each directory and its `tasks` file so an
    /// unprivileged supervisor can move processes in.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if a directory cannot be created,
    /// the cpuset parameters cannot be inherited, or ownership cannot be
    /// changed. Directories created before the failure are removed.
    pub fn create(
        name: &str,
        cgroup_root: &Path,
        parent: Option<&str>,
        owner: Option<(Uid, Gid)>,
    ) -> Result<Self> {
        let mut cgroup = Self {
            name: name.to_owned(),
            paths: BTreeMap::new(),
            policy: DevicePolicy::default(),
        };

        for sub in CgroupSubsystem::ALL {
            let hierarchy = cgroup_root.join(sub.name());
            if !hierarchy.is_dir() {
                tracing::debug!(subsystem = %sub, "cgroup hierarchy not mounted, skipping");
                continue;
            }
            let parent_dir = parent.map_or_else(|| hierarchy.clone(), |p| hierarchy.join(p));
            let path = parent_dir.join(name);
            std::fs::create_dir_all(&path).map_err(|e| VesselError::CgroupFailed {
                message: format!("creating {}: {e}", path.display()),
            })?;
            let _ = cgroup.paths.insert(sub, path.clone());

            if sub == CgroupSubsystem::Cpuset {
                inherit_cpuset(&parent_dir, &path)?;
            }
            if let Some((uid, gid)) = owner {
                chown_cgroup(&path, uid, gid)?;
            }
        }

        tracing::info!(name, subsystems = cgroup.paths.len(), "cgroup created");
        Ok(cgroup)
    }

    /// Container name the cgroup was created for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory of `sub`, if that hierarchy is mounted.
    #[must_use]
    pub fn path(&self, sub: CgroupSubsystem) -> Option<&Path> {
        self.paths.get(&sub).map(PathBuf::as_path)
    }

    /// `tasks` file of every created subsystem directory.
    #[must_use]
    pub fn task_paths(&self) -> Vec<PathBuf> {
        self.paths.values().map(|p| p.join("tasks")).collect()
    }

    /// Moves `pid` into every subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if a `tasks` file cannot be
    /// written.
    pub fn add_process(&self, pid: Pid) -> Result<()> {
        for tasks in self.task_paths() {
            std::fs::write(&tasks, pid.to_string()).map_err(|e| VesselError::CgroupFailed {
                message: format!("adding {pid} to {}: {e}", tasks.display()),
            })?;
        }
        tracing::debug!(%pid, "added process to cgroup");
        Ok(())
    }

    /// Revokes access to every device.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if the `devices` hierarchy is
    /// missing or `devices.deny` cannot be written.
    pub fn deny_all_devices(&mut self) -> Result<()> {
        self.write_devices_file("devices.deny", "a")?;
        self.policy.deny_all();
        tracing::debug!(name = %self.name, "denied all devices");
        Ok(())
    }

    /// Applies one allow or deny rule after all previous ones.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if the `devices` hierarchy is
    /// missing or the control file cannot be written.
    pub fn add_device_rule(&mut self, rule: DeviceRule) -> Result<()> {
        let line = rule.to_cgroup_line();
        self.write_devices_file(rule.control_file(), &line)?;
        self.policy.apply(rule);
        tracing::debug!(name = %self.name, rule = %line, "device rule applied");
        Ok(())
    }

    /// Rules applied so far.
    #[must_use]
    pub const fn device_policy(&self) -> &DevicePolicy {
        &self.policy
    }

    /// Whether the applied rules grant `access` to the device.
    #[must_use]
    pub fn device_permitted(
        &self,
        kind: DeviceType,
        major: u32,
        minor: u32,
        access: devices::DeviceAccess,
    ) -> bool {
        self.policy.permits(kind, major, minor, access)
    }

    /// See [`cpu::set_cpu_shares`].
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if the `cpu` hierarchy is
    /// missing or the write fails.
    pub fn set_cpu_shares(&self, shares: u64) -> Result<()> {
        cpu::set_cpu_shares(self.cpu_path()?, shares)
    }

    /// See [`cpu::set_cpu_quota`].
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if the `cpu` hierarchy is
    /// missing or the write fails.
    pub fn set_cpu_quota(&self, quota_us: i64, period_us: u64) -> Result<()> {
        cpu::set_cpu_quota(self.cpu_path()?, quota_us, period_us)
    }

    /// See [`cpu::set_cpu_rt`].
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::CgroupFailed`] if the `cpu` hierarchy is
    /// missing or the write fails.
    pub fn set_cpu_rt(&self, runtime_us: u64, period_us: u64) -> Result<()> {
        cpu::set_cpu_rt(self.cpu_path()?, runtime_us, period_us)
    }

    /// Removes every cgroup directory. Safe to call more than once.
    ///
    /// Returns `false` if any directory could not be removed; the failure is
    /// logged and the remaining directories are still attempted.
    pub fn destroy(&mut self) -> bool {
        let mut ok = true;
        for (sub, path) in std::mem::take(&mut self.paths) {
            if let Err(e) = std::fs::remove_dir(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(subsystem = %sub, path = %path.display(), error = %e, "failed to remove cgroup");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Gives up ownership: the directories outlive this handle.
    pub fn release(mut self) {
        self.paths.clear();
    }

    fn cpu_path(&self) -> Result<&Path> {
        self.path(CgroupSubsystem::Cpu)
            .ok_or_else(|| VesselError::CgroupFailed {
                message: "cpu controller not available".into(),
            })
    }

    fn write_devices_file(&self, file: &str, line: &str) -> Result<()> {
        let dir = self
            .path(CgroupSubsystem::Devices)
            .ok_or_else(|| VesselError::CgroupFailed {
                message: "devices controller not available".into(),
            })?;
        let path = dir.join(file);
        std::fs::write(&path, line).map_err(|e| VesselError::CgroupFailed {
            message: format!("writing '{line}' to {}: {e}", path.display()),
        })
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

fn inherit_cpuset(parent: &Path, child: &Path) -> Result<()> {
    for file in ["cpuset.cpus", "cpuset.mems"] {
        let src = parent.join(file);
        let Ok(value) = std::fs::read_to_string(&src) else {
            continue;
        };
        let dst = child.join(file);
        std::fs::write(&dst, value.trim()).map_err(|e| VesselError::CgroupFailed {
            message: format!("writing {}: {e}", dst.display()),
        })?;
    }
    Ok(())
}

fn chown_cgroup(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    let tasks = path.join("tasks");
    for p in [path, tasks.as_path()] {
        if !p.exists() {
            continue;
        }
        chown(p, Some(uid), Some(gid)).map_err(|e| VesselError::CgroupFailed {
            message: format!("chown {}: {e}", p.display()),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::devices::DeviceAccess;
    use super::*;

    fn fake_root(subsystems: &[CgroupSubsystem]) -> tempfile::TempDir {
        let root = tempfile::tempdir().expect("tempdir");
        for sub in subsystems {
            std::fs::create_dir(root.path().join(sub.name())).expect("mkdir");
        }
        root
    }

    #[test]
    fn creates_only_mounted_subsystems() {
        let root = fake_root(&[CgroupSubsystem::Cpu, CgroupSubsystem::Devices]);
        let cg = Cgroup::create("c1", root.path(), Some("android"), None).expect("create");
        assert_eq!(
            cg.path(CgroupSubsystem::Cpu),
            Some(root.path().join("cpu/android/c1").as_path())
        );
        assert!(cg.path(CgroupSubsystem::Freezer).is_none());
        assert_eq!(cg.task_paths().len(), 2);
    }

    #[test]
    fn cpuset_inherits_parent_values() {
        let root = fake_root(&[CgroupSubsystem::Cpuset]);
        std::fs::write(root.path().join("cpuset/cpuset.cpus"), "0-3\n").expect("write");
        let cg = Cgroup::create("c1", root.path(), None, None).expect("create");
        let cpus = std::fs::read_to_string(
            cg.path(CgroupSubsystem::Cpuset).expect("cpuset").join("cpuset.cpus"),
        )
        .expect("read");
        assert_eq!(cpus, "0-3");
    }

    #[test]
    fn device_rules_are_written_and_mirrored() {
        let root = fake_root(&[CgroupSubsystem::Devices]);
        let mut cg = Cgroup::create("c1", root.path(), None, None).expect("create");
        cg.deny_all_devices().expect("deny");
        cg.add_device_rule(
            DeviceRule::from_raw(true, DeviceType::Char, 1, 3, DeviceAccess::ALL).expect("rule"),
        )
        .expect("allow");

        let dir = cg.path(CgroupSubsystem::Devices).expect("devices");
        assert_eq!(std::fs::read_to_string(dir.join("devices.deny")).expect("read"), "a");
        assert_eq!(
            std::fs::read_to_string(dir.join("devices.allow")).expect("read"),
            "c 1:3 rwm"
        );
        assert!(cg.device_permitted(DeviceType::Char, 1, 3, DeviceAccess::READ));
        assert!(!cg.device_permitted(DeviceType::Char, 1, 5, DeviceAccess::READ));
    }

    #[test]
    fn cpu_params_require_cpu_hierarchy() {
        let root = fake_root(&[CgroupSubsystem::Devices]);
        let cg = Cgroup::create("c1", root.path(), None, None).expect("create");
        assert!(matches!(
            cg.set_cpu_shares(512),
            Err(VesselError::CgroupFailed { .. })
        ));
    }

    #[test]
    fn destroy_is_idempotent() {
        let root = fake_root(&[CgroupSubsystem::Freezer]);
        let mut cg = Cgroup::create("c1", root.path(), None, None).expect("create");
        let dir = cg.path(CgroupSubsystem::Freezer).expect("freezer").to_path_buf();
        assert!(cg.destroy());
        assert!(!dir.exists());
        assert!(cg.destroy());
    }

    #[test]
    fn released_cgroup_outlives_handle() {
        let root = fake_root(&[CgroupSubsystem::Freezer]);
        let cg = Cgroup::create("c1", root.path(), None, None).expect("create");
        let dir = cg.path(CgroupSubsystem::Freezer).expect("freezer").to_path_buf();
        cg.release();
        assert!(dir.is_dir());
    }
}
