//! Mount utilities for container filesystem setup.
//!
//! Mounts performed here happen in the supervisor's own mount namespace;
//! the caller records each destination so it can be unmounted on teardown.

use std::fs::OpenOptions;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::mount::{MntFlags, MsFlags};
use nix::unistd::{Gid, Uid, chown};

use vessel_common::error::{Result, VesselError};

/// Mounts `source` on `target`.
///
/// The kernel ignores `MS_RDONLY` on the initial bind mount, so a read-only
/// bind is done as a bind followed by a read-only remount.
///
/// # Errors
///
/// Returns an error if either `mount(2)` call fails.
#[cfg(target_os = "linux")]
pub fn mount_external(
    source: &Path,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    let bind_ro = flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY);
    let first = if bind_ro {
        flags - MsFlags::MS_RDONLY
    } else {
        flags
    };

    let fail = |e: nix::errno::Errno| {
        VesselError::io(
            target,
            std::io::Error::other(format!("mount {} failed: {e}", source.display())),
        )
    };

    nix::mount::mount(Some(source), target, fstype, first, data).map_err(fail)?;
    if bind_ro {
        nix::mount::mount(
            Some(source),
            target,
            fstype,
            first | MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT,
            data,
        )
        .map_err(fail)?;
    }

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        flags = flags.bits(),
        "mounted"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error; mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_external(
    _source: &Path,
    _target: &Path,
    _fstype: Option<&str>,
    _flags: MsFlags,
    _data: Option<&str>,
) -> Result<()> {
    Err(VesselError::config("Linux required for native container operations"))
}

/// Unmounts `target`.
///
/// # Errors
///
/// Returns an error if `umount2(2)` fails.
pub fn unmount(target: &Path) -> Result<()> {
    nix::mount::umount2(target, MntFlags::empty())
        .map_err(|e| VesselError::io(target, std::io::Error::from(e)))?;
    tracing::debug!(target = %target.display(), "unmounted");
    Ok(())
}

/// Lazily detaches `target` from the mount tree.
///
/// # Errors
///
/// Returns an error if `umount2(2)` fails.
pub fn unmount_detached(target: &Path) -> Result<()> {
    nix::mount::umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| VesselError::io(target, std::io::Error::from(e)))?;
    tracing::debug!(target = %target.display(), "detached");
    Ok(())
}

/// Creates a directory owned by `uid:gid` with the given mode.
///
/// An existing directory is reused and has its owner and mode reset.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or its ownership or
/// permissions cannot be changed.
pub fn make_dir(path: &Path, uid: Uid, gid: Gid, mode: u32) -> Result<()> {
    if let Err(e) = std::fs::create_dir(path) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(VesselError::io(path, e));
        }
    }
    set_owner_and_mode(path, uid, gid, mode)
}

/// Creates an empty regular file owned by `uid:gid` with the given mode.
///
/// An existing file is left untouched apart from owner and mode.
///
/// # Errors
///
/// Returns an error if the file cannot be created or its ownership or
/// permissions cannot be changed.
pub fn touch_file(path: &Path, uid: Uid, gid: Gid, mode: u32) -> Result<()> {
    let _file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(mode)
        .open(path)
        .map_err(|e| VesselError::io(path, e))?;
    set_owner_and_mode(path, uid, gid, mode)
}

fn set_owner_and_mode(path: &Path, uid: Uid, gid: Gid, mode: u32) -> Result<()> {
    chown(path, Some(uid), Some(gid))
        .map_err(|e| VesselError::io(path, std::io::Error::from(e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| VesselError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> (Uid, Gid) {
        (Uid::current(), Gid::current())
    }

    #[test]
    fn make_dir_sets_mode_and_is_reentrant() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("d");
        let (uid, gid) = me();
        make_dir(&dir, uid, gid, 0o750).expect("mkdir");
        make_dir(&dir, uid, gid, 0o700).expect("mkdir again");
        let mode = std::fs::metadata(&dir).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn touch_file_creates_regular_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("f");
        let (uid, gid) = me();
        touch_file(&file, uid, gid, 0o640).expect("touch");
        let meta = std::fs::metadata(&file).expect("stat");
        assert!(meta.is_file());
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn make_dir_without_parent_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (uid, gid) = me();
        assert!(make_dir(&tmp.path().join("a/b"), uid, gid, 0o750).is_err());
    }

    #[test]
    fn unmounting_a_plain_directory_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(unmount(tmp.path()).is_err());
    }
}
