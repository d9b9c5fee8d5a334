//! On-disk state of detached containers.
//!
//! A detached container lives in `<run_containers_dir>/<id>`, holding its
//! `config.json`, a `container.pid` file and an empty `.run_oci` tag that
//! marks the directory as managed by this runtime.

use std::io::Read as _;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use vessel_common::constants::{CONTAINER_PID_FILENAME, MAX_PID_FILE_LEN, RUN_OCI_TAG_FILENAME};
use vessel_common::error::{Result, VesselError};
use vessel_core::filesystem::{mount, mountinfo};

/// Writes `pid` followed by a newline to the container's pid file.
///
/// # Errors
///
/// Returns [`VesselError::Io`] if the file cannot be written.
pub fn write_container_pid(container_dir: &Path, pid: Pid) -> Result<()> {
    let path = container_dir.join(CONTAINER_PID_FILENAME);
    std::fs::write(&path, format!("{pid}\n")).map_err(|e| VesselError::io(&path, e))
}

/// Reads the init pid of the container in `container_dir`.
///
/// # Errors
///
/// Returns [`VesselError::Io`] if the pid file cannot be read,
/// [`VesselError::InvalidState`] if it does not hold a pid, or
/// [`VesselError::NotFound`] if the directory lacks the `.run_oci` tag.
pub fn read_container_pid(container_dir: &Path) -> Result<Pid> {
    let path = container_dir.join(CONTAINER_PID_FILENAME);
    let mut contents = String::new();
    let _ = std::fs::File::open(&path)
        .and_then(|f| f.take(MAX_PID_FILE_LEN).read_to_string(&mut contents))
        .map_err(|e| VesselError::io(&path, e))?;
    let pid: i32 = contents.trim().parse().map_err(|_| VesselError::InvalidState {
        message: format!("{} does not hold a pid", path.display()),
    })?;

    if !container_dir.join(RUN_OCI_TAG_FILENAME).exists() {
        return Err(VesselError::NotFound {
            kind: "managed container",
            id: container_dir.display().to_string(),
        });
    }
    Ok(Pid::from_raw(pid))
}

/// Marks `container_dir` as managed by this runtime.
///
/// # Errors
///
/// Returns [`VesselError::Io`] if the tag cannot be created.
pub fn write_tag(container_dir: &Path) -> Result<()> {
    let path = container_dir.join(RUN_OCI_TAG_FILENAME);
    std::fs::write(&path, b"").map_err(|e| VesselError::io(&path, e))
}

/// Bundle directory of a container given its `config.json`.
///
/// An in-place container's config lives in the bundle itself; otherwise it
/// is a symlink into the bundle.
///
/// # Errors
///
/// Returns [`VesselError::Io`] if the symlink cannot be read.
pub fn bundle_path(config_file: &Path) -> Result<PathBuf> {
    let is_link = config_file
        .symlink_metadata()
        .is_ok_and(|md| md.file_type().is_symlink());
    let config = if is_link {
        std::fs::read_link(config_file).map_err(|e| VesselError::io(config_file, e))?
    } else {
        config_file.to_path_buf()
    };
    Ok(config.parent().map(Path::to_path_buf).unwrap_or_default())
}

/// Detaches every mount under `container_dir`, deepest first, then deletes
/// the directory.
///
/// Best effort: failures are logged and the remaining steps still run.
/// Returns `true` if everything was removed.
pub fn cleanup_container(container_dir: &Path, mounts_file: &Path) -> bool {
    let mut ok = unmount_under(container_dir, mounts_file);
    if let Err(e) = std::fs::remove_dir_all(container_dir) {
        tracing::error!(path = %container_dir.display(), error = %e, "failed to remove container directory");
        ok = false;
    }
    ok
}

/// Detaches every mount under `dir`, deepest first.
pub fn unmount_under(dir: &Path, mounts_file: &Path) -> bool {
    let mountpoints = match mountinfo::mountpoints_under(dir, mounts_file) {
        Ok(points) => points,
        Err(e) => {
            tracing::error!(error = %e, "failed to list mountpoints");
            return false;
        }
    };
    let mut ok = true;
    for point in mountpoints {
        if let Err(e) = mount::unmount_detached(&point) {
            tracing::error!(path = %point.display(), error = %e, "failed to unmount");
            ok = false;
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_roundtrips_through_the_pid_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_tag(dir.path()).expect("tag");
        write_container_pid(dir.path(), Pid::from_raw(4_194_304)).expect("write");
        assert_eq!(
            std::fs::read_to_string(dir.path().join(CONTAINER_PID_FILENAME)).expect("read"),
            "4194304\n"
        );
        assert_eq!(read_container_pid(dir.path()).expect("pid"), Pid::from_raw(4_194_304));
    }

    #[test]
    fn untagged_directory_is_not_managed() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_container_pid(dir.path(), Pid::from_raw(7)).expect("write");
        assert!(matches!(
            read_container_pid(dir.path()),
            Err(VesselError::NotFound { .. })
        ));
    }

    #[test]
    fn oversized_pid_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_tag(dir.path()).expect("tag");
        std::fs::write(dir.path().join(CONTAINER_PID_FILENAME), "1234567890123456789\n")
            .expect("write");
        assert!(matches!(
            read_container_pid(dir.path()),
            Err(VesselError::InvalidState { .. })
        ));
    }

    #[test]
    fn missing_pid_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(read_container_pid(dir.path()), Err(VesselError::Io { .. })));
    }

    #[test]
    fn bundle_of_symlinked_config_is_the_link_target_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bundle = dir.path().join("bundle");
        let state = dir.path().join("state");
        std::fs::create_dir(&bundle).expect("bundle");
        std::fs::create_dir(&state).expect("state");
        std::fs::write(bundle.join("config.json"), "{}").expect("config");
        std::os::unix::fs::symlink(bundle.join("config.json"), state.join("config.json"))
            .expect("symlink");

        assert_eq!(bundle_path(&state.join("config.json")).expect("linked"), bundle);
        assert_eq!(bundle_path(&bundle.join("config.json")).expect("inplace"), bundle);
    }

    #[test]
    fn cleanup_removes_directory_without_mounts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let container = dir.path().join("c1");
        std::fs::create_dir_all(container.join("rootfs/etc")).expect("mkdir");
        let mounts = dir.path().join("mounts");
        std::fs::write(&mounts, "proc /proc proc rw 0 0\n").expect("mounts");

        assert!(cleanup_container(&container, &mounts));
        assert!(!container.exists());
    }
}
