//! Device nodes and device cgroup policy for a container.

use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use vessel_common::error::{Result, VesselError};
use vessel_core::cgroup::Cgroup;
use vessel_core::cgroup::devices::{DeviceAccess, DeviceRule, DeviceType};
use vessel_core::device::{DeviceNode, host_device_numbers};
use vessel_core::namespace::user::IdMap;

use crate::config::DeviceSpec;
use crate::mounts::path_in_outer_namespace;

/// Creates the configured device nodes under `root`.
///
/// Devices copying their minor number from the host are skipped when the
/// host node does not exist, as are devices with a negative minor.
///
/// # Errors
///
/// Returns [`VesselError::ConfigInvalid`] if an owner is not covered by the
/// id maps, or [`VesselError::DeviceFailed`] if a node cannot be created.
pub fn create_device_nodes(
    root: &Path,
    devices: &[DeviceSpec],
    uid_map: &IdMap,
    gid_map: &IdMap,
) -> Result<()> {
    for dev in devices {
        let minor = if dev.copy_minor {
            match host_device_numbers(&dev.path) {
                Some((_, minor)) => minor,
                None => continue,
            }
        } else {
            match u32::try_from(dev.minor) {
                Ok(minor) => minor,
                Err(_) => continue,
            }
        };
        let node = DeviceNode {
            path: path_in_outer_namespace(root, &dev.path),
            kind: dev.kind,
            mode: dev.mode,
            major: dev.major,
            minor,
            uid: Uid::from_raw(uid_map.outside_id(dev.uid)?),
            gid: Gid::from_raw(gid_map.outside_id(dev.gid)?),
        };
        node.create()?;
    }
    Ok(())
}

/// Applies the device cgroup policy: deny everything, then each rule in
/// order, then read access to every loop device backing a mount.
///
/// # Errors
///
/// Returns [`VesselError::CgroupFailed`] if a rule cannot be written, or
/// [`VesselError::DeviceFailed`] if a loop device cannot be stat'ed.
pub fn device_setup(cgroup: &mut Cgroup, rules: &[DeviceRule], loop_devices: &[PathBuf]) -> Result<()> {
    cgroup.deny_all_devices()?;
    for rule in rules {
        cgroup.add_device_rule(*rule)?;
    }
    for device in loop_devices {
        let (major, minor) =
            host_device_numbers(device).ok_or_else(|| VesselError::DeviceFailed {
                message: format!("cannot stat loop device {}", device.display()),
            })?;
        cgroup.add_device_rule(DeviceRule {
            allow: true,
            kind: DeviceType::Block,
            major: Some(major),
            minor: Some(minor),
            access: DeviceAccess::READ,
        })?;
    }
    tracing::debug!(
        name = %cgroup.name(),
        rules = cgroup.device_policy().rules().len(),
        "device cgroup configured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use vessel_core::cgroup::CgroupSubsystem;

    use super::*;

    fn devices_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(root.path().join(CgroupSubsystem::Devices.name())).expect("mkdir");
        root
    }

    #[test]
    fn last_rule_wins_for_overlapping_rules() {
        let root = devices_root();
        let mut cg = Cgroup::create("dev-test", root.path(), None, None).expect("cgroup");
        let rules = [
            DeviceRule::from_raw(true, DeviceType::Block, -1, -1, DeviceAccess::ALL)
                .expect("allow block"),
            DeviceRule::from_raw(false, DeviceType::Block, 1, 5, DeviceAccess::ALL)
                .expect("deny 1:5"),
        ];
        device_setup(&mut cg, &rules, &[]).expect("device setup");

        assert!(cg.device_permitted(DeviceType::Block, 8, 0, DeviceAccess::ALL));
        assert!(cg.device_permitted(DeviceType::Block, 1, 4, DeviceAccess::READ));
        assert!(!cg.device_permitted(DeviceType::Block, 1, 5, DeviceAccess::READ));
        assert!(!cg.device_permitted(DeviceType::Char, 1, 3, DeviceAccess::READ));

        let dir = cg.path(CgroupSubsystem::Devices).expect("devices dir");
        assert_eq!(
            std::fs::read_to_string(dir.join("devices.deny")).expect("deny file"),
            "b 1:5 rwm"
        );
    }

    #[test]
    fn missing_loop_device_fails_setup() {
        let root = devices_root();
        let mut cg = Cgroup::create("loop-test", root.path(), None, None).expect("cgroup");
        let err = device_setup(&mut cg, &[], &[PathBuf::from("/nonexistent/loop9")])
            .expect_err("missing loop device");
        assert!(matches!(err, VesselError::DeviceFailed { .. }));
    }

    #[test]
    fn copied_minor_skips_absent_host_node() {
        let root = tempfile::tempdir().expect("tempdir");
        let dev = DeviceSpec {
            kind: DeviceType::Char,
            path: PathBuf::from("/dev/vessel-does-not-exist"),
            mode: 0o666,
            major: 10,
            minor: -1,
            copy_minor: true,
            uid: 0,
            gid: 0,
        };
        create_device_nodes(root.path(), &[dev], &IdMap::default(), &IdMap::default())
            .expect("skipped");
        assert!(!root.path().join("dev").exists());
    }

    #[test]
    fn unmapped_device_owner_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let dev = DeviceSpec {
            kind: DeviceType::Char,
            path: PathBuf::from("/null"),
            mode: 0o666,
            major: 1,
            minor: 3,
            copy_minor: false,
            uid: 5,
            gid: 0,
        };
        let err = create_device_nodes(root.path(), &[dev], &IdMap::single(1000), &IdMap::single(1000))
            .expect_err("unmapped uid");
        assert!(matches!(err, VesselError::ConfigInvalid { .. }));
    }

    #[test]
    #[ignore = "requires root"]
    fn creates_nodes_under_root() {
        let root = tempfile::tempdir().expect("tempdir");
        let dev = DeviceSpec {
            kind: DeviceType::Char,
            path: PathBuf::from("/null"),
            mode: 0o666,
            major: 1,
            minor: 3,
            copy_minor: false,
            uid: 0,
            gid: 0,
        };
        create_device_nodes(root.path(), &[dev], &IdMap::default(), &IdMap::default())
            .expect("create");
        assert_eq!(host_device_numbers(&root.path().join("null")), Some((1, 3)));
    }
}
