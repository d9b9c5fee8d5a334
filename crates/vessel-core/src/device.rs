//! Device node creation.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::{Gid, Uid, chown};

use vessel_common::error::{Result, VesselError};

use crate::cgroup::devices::DeviceType;

/// A device node to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// Absolute path of the node.
    pub path: PathBuf,
    /// Block or character device.
    pub kind: DeviceType,
    /// Permission bits.
    pub mode: u32,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
    /// Owner.
    pub uid: Uid,
    /// Group.
    pub gid: Gid,
}

impl DeviceNode {
    /// Creates the node, then sets its owner and permissions.
    ///
    /// An existing node at `path` is reused.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::DeviceFailed`] if the type is not block or
    /// character, or `mknod(2)`, `chown(2)` or `chmod(2)` fails.
    pub fn create(&self) -> Result<()> {
        let kind = match self.kind {
            DeviceType::Block => SFlag::S_IFBLK,
            DeviceType::Char => SFlag::S_IFCHR,
            DeviceType::All => {
                return Err(VesselError::DeviceFailed {
                    message: format!("{}: node type must be 'b' or 'c'", self.path.display()),
                });
            }
        };
        let fail = |op: &str, e: &dyn std::fmt::Display| VesselError::DeviceFailed {
            message: format!("{op} {}: {e}", self.path.display()),
        };

        let dev = makedev(u64::from(self.major), u64::from(self.minor));
        match mknod(
            &self.path,
            kind,
            Mode::from_bits_truncate(self.mode & 0o7777),
            dev,
        ) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(fail("mknod", &e)),
        }
        chown(&self.path, Some(self.uid), Some(self.gid)).map_err(|e| fail("chown", &e))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(self.mode))
            .map_err(|e| fail("chmod", &e))?;

        tracing::debug!(
            path = %self.path.display(),
            major = self.major,
            minor = self.minor,
            "device node created"
        );
        Ok(())
    }
}

/// Major and minor number of the device node at `path` on the host.
///
/// Returns `None` if `path` cannot be stat'ed.
#[must_use]
pub fn host_device_numbers(path: &Path) -> Option<(u32, u32)> {
    let st = nix::sys::stat::stat(path).ok()?;
    #[allow(clippy::useless_conversion)]
    let rdev = u64::from(st.st_rdev);
    let major = u32::try_from(nix::sys::stat::major(rdev)).ok()?;
    let minor = u32::try_from(nix::sys::stat::minor(rdev)).ok()?;
    Some((major, minor))
}
