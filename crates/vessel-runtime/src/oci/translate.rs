//! Translation of an [`OciConfig`] into a [`ContainerConfig`].

use std::path::{Path, PathBuf};

use nix::mount::MsFlags;

use vessel_common::constants::DEFAULT_MOUNT_MODE;
use vessel_common::error::{Result, VesselError};
use vessel_core::capability;
use vessel_core::cgroup::devices::{DeviceAccess, DeviceRule, DeviceType};

use super::spec::{OciConfig, OciDevice, OciIdMapping, OciMount};
use crate::config::{ContainerConfig, DeviceSpec, MountSpec};

/// Mount options split into what `mount(2)` and the mount table need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Flags recognized by name.
    pub flags: MsFlags,
    /// `loop` was given.
    pub loopback: bool,
    /// Parameters of a `dm=` option.
    pub verity: Option<String>,
    /// Every other option, comma-joined, for the filesystem.
    pub data: Option<String>,
}

/// Splits `mount(8)` style options into flags, loop and verity settings,
/// and a data string.
#[must_use]
pub fn parse_mount_options<S: AsRef<str>>(options: &[S]) -> MountOptions {
    let mut flags = MsFlags::empty();
    let mut loopback = false;
    let mut verity = None;
    let mut data: Vec<&str> = Vec::new();

    for option in options.iter().map(AsRef::as_ref) {
        match option {
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "bind" => flags |= MsFlags::MS_BIND,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "private" => flags |= MsFlags::MS_PRIVATE,
            "recursive" => flags |= MsFlags::MS_REC,
            "slave" => flags |= MsFlags::MS_SLAVE,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "loop" => loopback = true,
            other => match other.strip_prefix("dm=") {
                Some(params) => verity = Some(params.to_owned()),
                None => data.push(other),
            },
        }
    }

    MountOptions {
        flags,
        loopback,
        verity,
        data: (!data.is_empty()).then(|| data.join(",")),
    }
}

/// `proc` and `sysfs` are always mounted `nodev,noexec,nosuid`.
#[must_use]
pub fn sanitize_flags(fstype: &str, flags: MsFlags) -> MsFlags {
    if fstype != "proc" && fstype != "sysfs" {
        return flags;
    }
    let sanitized = flags | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
    if sanitized != flags {
        tracing::warn!(fstype, "sanitized mount flags");
    }
    sanitized
}

/// Renders id mappings as comma-separated `inside outside count` triples.
#[must_use]
pub fn id_map_string(maps: &[OciIdMapping]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}", m.container_id, m.host_id, m.size))
        .collect::<Vec<_>>()
        .join(",")
}

/// Resource number of an `RLIMIT_*` name.
#[must_use]
#[allow(clippy::cast_possible_wrap, clippy::unnecessary_cast)]
pub fn rlimit_from_name(name: &str) -> Option<i32> {
    let resource = match name {
        "RLIMIT_AS" => libc::RLIMIT_AS,
        "RLIMIT_CORE" => libc::RLIMIT_CORE,
        "RLIMIT_CPU" => libc::RLIMIT_CPU,
        "RLIMIT_DATA" => libc::RLIMIT_DATA,
        "RLIMIT_FSIZE" => libc::RLIMIT_FSIZE,
        "RLIMIT_LOCKS" => libc::RLIMIT_LOCKS,
        "RLIMIT_MEMLOCK" => libc::RLIMIT_MEMLOCK,
        "RLIMIT_MSGQUEUE" => libc::RLIMIT_MSGQUEUE,
        "RLIMIT_NICE" => libc::RLIMIT_NICE,
        "RLIMIT_NOFILE" => libc::RLIMIT_NOFILE,
        "RLIMIT_NPROC" => libc::RLIMIT_NPROC,
        "RLIMIT_RSS" => libc::RLIMIT_RSS,
        "RLIMIT_RTPRIO" => libc::RLIMIT_RTPRIO,
        "RLIMIT_RTTIME" => libc::RLIMIT_RTTIME,
        "RLIMIT_SIGPENDING" => libc::RLIMIT_SIGPENDING,
        "RLIMIT_STACK" => libc::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource as i32)
}

/// Builds the container configuration for a bundle whose files live in
/// `container_root`. `extra_args` are appended to the program's arguments.
///
/// The bundle's root is used as a premounted runfs, so no rootfs bind mount
/// is made.
///
/// # Errors
///
/// Returns [`VesselError::ConfigInvalid`] for an empty program, malformed
/// id mappings, unknown device types, capability or rlimit names, or any
/// value a [`ContainerConfig`] setter rejects.
pub fn config_from_oci(
    oci: &OciConfig,
    container_root: &Path,
    extra_args: &[String],
) -> Result<ContainerConfig> {
    let mut config = ContainerConfig::new();
    let process = &oci.process;

    config.config_root(container_root);
    config.set_uid(process.user.uid);
    config.set_gid(process.user.gid);
    config.premounted_runfs(&container_root.join(&oci.root.path));

    let argv: Vec<&str> = process
        .args
        .iter()
        .chain(extra_args)
        .map(String::as_str)
        .collect();
    config.program_argv(&argv)?;

    config.uid_map(&id_map_string(&oci.linux.uid_mappings))?;
    config.gid_map(&id_map_string(&oci.linux.gid_mappings))?;

    for mount in &oci.mounts {
        config.add_mount(mount_spec(mount, process.user.uid, process.user.gid))?;
    }
    for device in &oci.linux.devices {
        config.add_device(device_spec(device)?, DeviceAccess::default())?;
    }
    for rule in &oci.linux.resources.devices {
        let kind = first_char(&rule.device_type).and_then(DeviceType::from_char)?;
        let access = DeviceAccess {
            read: rule.access.contains('r'),
            write: rule.access.contains('w'),
            modify: rule.access.contains('m'),
        };
        config.add_cgroup_device(DeviceRule::from_raw(
            rule.allow,
            kind,
            rule.major.unwrap_or(-1),
            rule.minor.unwrap_or(-1),
            access,
        )?);
    }
    for limit in &process.rlimits {
        let resource = rlimit_from_name(&limit.rlimit_type).ok_or_else(|| {
            VesselError::config(format!("unknown rlimit '{}'", limit.rlimit_type))
        })?;
        config.add_rlimit(resource, limit.soft, limit.hard)?;
    }

    if !process.capabilities.is_empty() {
        let effective = process
            .capabilities
            .get("effective")
            .map_or(&[][..], Vec::as_slice);
        config.set_capmask(
            capability::mask_from_names(effective)?,
            process.capabilities.contains_key("ambient"),
        );
    }
    if !process.selinux_label.is_empty() {
        config.set_selinux_context(&process.selinux_label)?;
    }

    Ok(config)
}

/// Adds `source:destination` bind mounts performed inside the container's
/// mount namespace.
///
/// # Errors
///
/// Returns [`VesselError::ConfigInvalid`] if a path is empty.
pub fn append_bind_mounts(config: &mut ContainerConfig, mounts: &[(PathBuf, PathBuf)]) -> Result<()> {
    for (source, destination) in mounts {
        config.add_mount(MountSpec {
            name: destination.display().to_string(),
            source: source.clone(),
            destination: destination.clone(),
            fstype: "bind".into(),
            data: None,
            verity: None,
            flags: MsFlags::MS_BIND,
            uid: 0,
            gid: 0,
            mode: DEFAULT_MOUNT_MODE,
            mount_in_ns: true,
            create: true,
            loopback: false,
        })?;
    }
    Ok(())
}

fn mount_spec(mount: &OciMount, uid: u32, gid: u32) -> MountSpec {
    let options = parse_mount_options(&mount.options);
    let source = std::fs::canonicalize(&mount.source)
        .or_else(|_| std::path::absolute(&mount.source))
        .unwrap_or_else(|_| mount.source.clone());
    MountSpec {
        name: mount.destination.display().to_string(),
        source,
        destination: mount.destination.clone(),
        fstype: mount.mount_type.clone(),
        data: options.data,
        verity: options.verity,
        flags: sanitize_flags(&mount.mount_type, options.flags),
        uid,
        gid,
        mode: DEFAULT_MOUNT_MODE,
        // Loop devices are attached from the supervisor, so those mounts
        // happen outside the container.
        mount_in_ns: !options.loopback,
        create: true,
        loopback: options.loopback,
    }
}

fn device_spec(device: &OciDevice) -> Result<DeviceSpec> {
    let kind = match first_char(&device.device_type)? {
        'b' => DeviceType::Block,
        'c' | 'u' => DeviceType::Char,
        other => {
            return Err(VesselError::config(format!(
                "device {}: unsupported type '{other}'",
                device.path.display()
            )));
        }
    };
    Ok(DeviceSpec {
        kind,
        path: device.path.clone(),
        mode: device.file_mode,
        major: device.major,
        minor: device.minor,
        copy_minor: false,
        uid: device.uid,
        gid: device.gid,
    })
}

fn first_char(s: &str) -> Result<char> {
    s.chars()
        .next()
        .ok_or_else(|| VesselError::config("empty device type"))
}
