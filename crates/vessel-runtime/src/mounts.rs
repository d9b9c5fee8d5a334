//! Mount table builder.
//!
//! Turns the configured [`MountSpec`] list into loop devices, verity targets
//! and mounts, in order. Mounts flagged `mount_in_ns` are handed to the jail;
//! the rest are performed here and recorded so they can be undone in reverse.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use nix::unistd::{Gid, Uid};

use vessel_common::defer::Deferred;
use vessel_common::error::{Result, VesselError};
use vessel_core::filesystem::{loopdev, mount, verity};
use vessel_core::jail::{Jail, JailMount};
use vessel_core::namespace::user::IdMap;

use crate::config::MountSpec;

/// Returns where `path`, as seen inside the container, lives under `root`.
#[must_use]
pub fn path_in_outer_namespace(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Paths and id maps the mount table is resolved against.
#[derive(Debug, Clone, Copy)]
pub struct MountContext<'a> {
    /// Container root as seen by the supervisor.
    pub root: &'a Path,
    /// Base for relative loopback sources.
    pub config_root: Option<&'a Path>,
    /// UID map of the container.
    pub uid_map: &'a IdMap,
    /// GID map of the container.
    pub gid_map: &'a IdMap,
}

/// Resources created by the supervisor for the mount table.
#[derive(Debug, Default)]
pub struct MountTable {
    ext_mounts: Vec<PathBuf>,
    loopdevs: Vec<PathBuf>,
    device_mappers: Vec<String>,
}

impl MountTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Destinations mounted from the supervisor, in mount order.
    #[must_use]
    pub fn external_mounts(&self) -> &[PathBuf] {
        &self.ext_mounts
    }

    /// Attached loop devices, in attach order.
    #[must_use]
    pub fn loop_devices(&self) -> &[PathBuf] {
        &self.loopdevs
    }

    /// Device-mapper targets, in creation order.
    #[must_use]
    pub fn device_mappers(&self) -> &[String] {
        &self.device_mappers
    }

    /// Returns `true` if nothing needs undoing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ext_mounts.is_empty() && self.loopdevs.is_empty() && self.device_mappers.is_empty()
    }

    /// Performs every mount in `mounts`, in order.
    ///
    /// Anything left over from a previous call is undone first.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::MountFailed`] naming the first mount that
    /// failed. Every mount, loop device and verity target created by this
    /// call is removed before returning.
    pub fn mount_all(
        &mut self,
        mounts: &[MountSpec],
        ctx: &MountContext<'_>,
        jail: &mut Jail,
    ) -> Result<()> {
        let _ = self.unmount_all();

        let mut table = Deferred::new(self, |t| {
            let _ = t.unmount_all();
        });
        for spec in mounts {
            table.mount_one(spec, ctx, jail).map_err(|e| match e {
                e @ VesselError::MountFailed { .. } => e,
                e => VesselError::MountFailed {
                    name: spec.name.clone(),
                    message: e.to_string(),
                },
            })?;
        }
        table.disarm();
        Ok(())
    }

    fn mount_one(&mut self, spec: &MountSpec, ctx: &MountContext<'_>, jail: &mut Jail) -> Result<()> {
        let dest = path_in_outer_namespace(ctx.root, &spec.destination);
        let mut source = if spec.flags.contains(MsFlags::MS_BIND) && spec.source.is_relative() {
            path_in_outer_namespace(ctx.root, &spec.source)
        } else if spec.loopback && spec.source.is_relative() {
            ctx.config_root.map_or_else(
                || spec.source.clone(),
                |base| path_in_outer_namespace(base, &spec.source),
            )
        } else {
            spec.source.clone()
        };

        // The jail creates destinations for the mounts it performs.
        if spec.create && !spec.mount_in_ns {
            setup_destination(spec, &source, &dest, ctx)?;
        }
        if spec.loopback {
            let device = loopdev::attach(&source)?;
            self.loopdevs.push(device.clone());
            source = device;
        }
        if let Some(params) = &spec.verity {
            let target = verity::setup(&source, params)?;
            self.device_mappers.push(target.name);
            source = target.path;
        }

        tracing::debug!(name = %spec.name, source = %source.display(), "mount prepared");
        if spec.mount_in_ns {
            jail.mount(JailMount {
                source,
                destination: spec.destination.clone(),
                fstype: Some(spec.fstype.clone()),
                flags: spec.flags,
                data: spec.data.clone(),
                create: spec.create,
            });
        } else {
            mount::mount_external(
                &source,
                &dest,
                Some(&spec.fstype),
                spec.flags,
                spec.data.as_deref(),
            )?;
            self.ext_mounts.push(dest);
        }
        Ok(())
    }

    /// Unmounts external mounts, detaches loop devices, and removes verity
    /// targets, each in reverse creation order.
    ///
    /// Failures are logged and do not stop the remaining steps. Returns
    /// `true` if everything was undone. A second call is a no-op.
    pub fn unmount_all(&mut self) -> bool {
        let mut ok = true;
        for target in self.ext_mounts.drain(..).rev() {
            if let Err(e) = mount::unmount(&target) {
                tracing::error!(path = %target.display(), error = %e, "failed to unmount");
                ok = false;
            }
        }
        for device in self.loopdevs.drain(..).rev() {
            if let Err(e) = loopdev::detach(&device) {
                tracing::error!(device = %device.display(), error = %e, "failed to detach loop device");
                ok = false;
            }
        }
        for name in self.device_mappers.drain(..).rev() {
            if let Err(e) = verity::teardown(&name) {
                tracing::error!(name = %name, error = %e, "failed to remove verity target");
                ok = false;
            }
        }
        ok
    }
}

/// Creates the destination of an external mount if it is missing: a
/// directory when the source is a directory, a block device or missing, an
/// empty file otherwise.
fn setup_destination(spec: &MountSpec, source: &Path, dest: &Path, ctx: &MountContext<'_>) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        return Ok(());
    }
    let uid = Uid::from_raw(ctx.uid_map.outside_id(spec.uid)?);
    let gid = Gid::from_raw(ctx.gid_map.outside_id(spec.gid)?);

    let is_file = std::fs::metadata(source)
        .is_ok_and(|md| !md.is_dir() && !md.file_type().is_block_device());
    if is_file {
        mount::touch_file(dest, uid, gid, spec.mode)
    } else {
        mount::make_dir(dest, uid, gid, spec.mode)
    }
}

#[cfg(test)]
mod tests {
    use vessel_common::constants::PROC_SELF_MOUNTS;
    use vessel_core::filesystem::mountinfo;

    use super::*;

    fn bind(name: &str, source: &Path, destination: &str) -> MountSpec {
        MountSpec {
            name: name.into(),
            source: source.to_path_buf(),
            destination: PathBuf::from(destination),
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
        }
    }

    fn current_user_maps() -> (IdMap, IdMap) {
        (
            IdMap::single(Uid::current().as_raw()),
            IdMap::single(Gid::current().as_raw()),
        )
    }

    #[test]
    fn outer_path_strips_leading_slash() {
        let root = Path::new("/run/vessel/c_abc/root");
        assert_eq!(
            path_in_outer_namespace(root, Path::new("/dev/null")),
            PathBuf::from("/run/vessel/c_abc/root/dev/null")
        );
        assert_eq!(
            path_in_outer_namespace(root, Path::new("etc")),
            PathBuf::from("/run/vessel/c_abc/root/etc")
        );
    }

    #[test]
    fn unmount_all_on_empty_table_is_noop() {
        let mut table = MountTable::new();
        assert!(table.unmount_all());
        assert!(table.unmount_all());
        assert!(table.is_empty());
    }

    #[test]
    fn mounts_in_namespace_are_queued_on_the_jail() {
        let root = tempfile::tempdir().expect("tempdir");
        let (uid_map, gid_map) = current_user_maps();
        let ctx = MountContext {
            root: root.path(),
            config_root: None,
            uid_map: &uid_map,
            gid_map: &gid_map,
        };
        let mut spec = bind("proc", Path::new("proc"), "/proc");
        spec.fstype = "proc".into();
        spec.flags = MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
        spec.mount_in_ns = true;

        let mut jail = Jail::new();
        let mut table = MountTable::new();
        table.mount_all(&[spec], &ctx, &mut jail).expect("mount_all");

        assert!(table.is_empty());
        assert_eq!(jail.mounts().len(), 1);
        assert_eq!(jail.mounts()[0].destination, PathBuf::from("/proc"));
        assert!(!root.path().join("proc").exists());
    }

    #[test]
    fn failed_mount_is_reported_by_name() {
        let root = tempfile::tempdir().expect("tempdir");
        let (uid_map, gid_map) = current_user_maps();
        let ctx = MountContext {
            root: root.path(),
            config_root: None,
            uid_map: &uid_map,
            gid_map: &gid_map,
        };
        let spec = bind("missing", Path::new("/nonexistent/vessel/src"), "/dst");

        let mut table = MountTable::new();
        let err = table
            .mount_all(&[spec], &ctx, &mut Jail::new())
            .expect_err("mount of a missing source");
        assert!(matches!(err, VesselError::MountFailed { ref name, .. } if name == "missing"));
        assert!(table.is_empty());
        // The destination was created before the mount was attempted.
        assert!(root.path().join("dst").is_dir());
    }

    #[test]
    fn file_sources_get_file_destinations() {
        let root = tempfile::tempdir().expect("tempdir");
        let src = tempfile::NamedTempFile::new().expect("source file");
        let (uid_map, gid_map) = current_user_maps();
        let ctx = MountContext {
            root: root.path(),
            config_root: None,
            uid_map: &uid_map,
            gid_map: &gid_map,
        };
        let spec = bind("file", src.path(), "/hosts");

        let mut table = MountTable::new();
        let _ = table.mount_all(&[spec], &ctx, &mut Jail::new());
        let created = root.path().join("hosts").is_file();
        assert!(table.unmount_all());
        assert!(created);
    }

    #[test]
    fn unmapped_owner_fails_the_mount() {
        let root = tempfile::tempdir().expect("tempdir");
        let (uid_map, gid_map) = current_user_maps();
        let ctx = MountContext {
            root: root.path(),
            config_root: None,
            uid_map: &uid_map,
            gid_map: &gid_map,
        };
        let mut spec = bind("data", root.path(), "/data");
        spec.uid = 1000;

        let err = MountTable::new()
            .mount_all(&[spec], &ctx, &mut Jail::new())
            .expect_err("unmapped uid");
        assert!(matches!(err, VesselError::MountFailed { .. }));
        assert!(!root.path().join("data").exists());
    }

    #[test]
    #[ignore = "requires root"]
    fn failure_midway_unmounts_the_earlier_mounts() {
        let root = tempfile::tempdir().expect("tempdir");
        let root_path = std::fs::canonicalize(root.path()).expect("canonical root");
        let src = tempfile::tempdir().expect("source");
        let (uid_map, gid_map) = current_user_maps();
        let ctx = MountContext {
            root: &root_path,
            config_root: None,
            uid_map: &uid_map,
            gid_map: &gid_map,
        };
        let specs = [
            bind("a", src.path(), "/a"),
            bind("b", src.path(), "/b"),
            bind("c", Path::new("/nonexistent/vessel/src"), "/c"),
        ];

        let mut table = MountTable::new();
        let err = table
            .mount_all(&specs, &ctx, &mut Jail::new())
            .expect_err("third mount fails");
        assert!(matches!(err, VesselError::MountFailed { ref name, .. } if name == "c"));
        assert!(table.is_empty());

        let left = mountinfo::mountpoints_under(&root_path, Path::new(PROC_SELF_MOUNTS))
            .expect("mount table");
        assert!(left.is_empty(), "still mounted: {left:?}");
    }
}

