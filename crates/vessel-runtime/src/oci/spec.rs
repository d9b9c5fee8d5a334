//! The subset of an OCI bundle's `config.json` the runtime consumes.
//!
//! Unknown fields are ignored so full runtime-spec documents parse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use vessel_common::error::{Result, VesselError};

/// Top-level bundle configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciConfig {
    /// Runtime-spec version the bundle was written for.
    #[serde(default)]
    pub oci_version: String,
    /// The contained program.
    #[serde(default)]
    pub process: OciProcess,
    /// Root filesystem.
    #[serde(default)]
    pub root: OciRoot,
    /// Hostname; also used as the container name.
    #[serde(default)]
    pub hostname: String,
    /// Mounts, in order.
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    /// Lifecycle hooks.
    #[serde(default)]
    pub hooks: OciHooks,
    /// Linux-specific settings.
    #[serde(default)]
    pub linux: OciLinux,
}

impl OciConfig {
    /// Parses a `config.json` document.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::Serialization`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::Io`] if the file cannot be read, or
    /// [`VesselError::Serialization`] if it is malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| VesselError::io(path, e))?;
        Self::from_json(&json)
    }
}

/// `process` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    /// Credentials inside the container.
    #[serde(default)]
    pub user: OciUser,
    /// Program and arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Capability sets by name: `effective`, `ambient`, ...
    #[serde(default)]
    pub capabilities: HashMap<String, Vec<String>>,
    /// Resource limits.
    #[serde(default)]
    pub rlimits: Vec<OciRlimit>,
    /// SELinux context of the program.
    #[serde(default)]
    pub selinux_label: String,
}

/// `process.user` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciUser {
    /// UID inside the container.
    #[serde(default)]
    pub uid: u32,
    /// GID inside the container.
    #[serde(default)]
    pub gid: u32,
}

/// One `process.rlimits` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRlimit {
    /// `RLIMIT_*` name.
    #[serde(rename = "type")]
    pub rlimit_type: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// `root` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRoot {
    /// Root filesystem, relative to the bundle.
    #[serde(default)]
    pub path: PathBuf,
}

/// One `mounts` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    /// Destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type.
    #[serde(rename = "type", default)]
    pub mount_type: String,
    /// Source path or device.
    #[serde(default)]
    pub source: PathBuf,
    /// Mount options, `mount(8)` style.
    #[serde(default)]
    pub options: Vec<String>,
}

/// `hooks` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciHooks {
    /// Run after the container process is set up, before it executes the
    /// program.
    #[serde(default)]
    pub prestart: Vec<OciHook>,
    /// Run once the program was started.
    #[serde(default)]
    pub poststart: Vec<OciHook>,
    /// Run after the container is gone.
    #[serde(default)]
    pub poststop: Vec<OciHook>,
}

/// One hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciHook {
    /// Absolute path of the executable.
    pub path: PathBuf,
    /// Arguments, including `argv[0]`.
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=value` pairs replacing the whole environment when non-empty.
    #[serde(default)]
    pub env: Vec<String>,
    /// Seconds before the hook is killed. No timeout when absent.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// `linux` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    /// UID mappings of the user namespace.
    #[serde(default)]
    pub uid_mappings: Vec<OciIdMapping>,
    /// GID mappings of the user namespace.
    #[serde(default)]
    pub gid_mappings: Vec<OciIdMapping>,
    /// Device nodes to create.
    #[serde(default)]
    pub devices: Vec<OciDevice>,
    /// Cgroup resources.
    #[serde(default)]
    pub resources: OciResources,
}

/// One id mapping range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciIdMapping {
    /// First id inside the namespace.
    #[serde(rename = "containerID")]
    pub container_id: u32,
    /// First id on the host.
    #[serde(rename = "hostID")]
    pub host_id: u32,
    /// Number of ids.
    pub size: u32,
}

/// One `linux.devices` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDevice {
    /// `b`, `c` or `u`.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Path inside the container.
    pub path: PathBuf,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: i32,
    /// Permission bits.
    #[serde(default)]
    pub file_mode: u32,
    /// Owner inside the container.
    #[serde(default)]
    pub uid: u32,
    /// Group inside the container.
    #[serde(default)]
    pub gid: u32,
}

/// `linux.resources` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciResources {
    /// Device cgroup rules, in order.
    #[serde(default)]
    pub devices: Vec<OciCgroupDevice>,
}

/// One device cgroup rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciCgroupDevice {
    /// Allow or deny.
    pub allow: bool,
    /// `a`, `b` or `c`.
    #[serde(rename = "type", default = "all_devices")]
    pub device_type: String,
    /// Major number; all when absent.
    #[serde(default)]
    pub major: Option<i32>,
    /// Minor number; all when absent.
    #[serde(default)]
    pub minor: Option<i32>,
    /// Any of `r`, `w`, `m`.
    #[serde(default)]
    pub access: String,
}

fn all_devices() -> String {
    "a".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "ociVersion": "1.0.0",
        "process": {
            "user": { "uid": 1000, "gid": 1000 },
            "args": ["/bin/sh", "-c", "true"],
            "cwd": "/",
            "capabilities": { "effective": ["CAP_NET_ADMIN"], "ambient": [] },
            "rlimits": [{ "type": "RLIMIT_NOFILE", "hard": 4096, "soft": 1024 }]
        },
        "root": { "path": "rootfs", "readonly": true },
        "hostname": "demo",
        "mounts": [
            { "destination": "/proc", "type": "proc", "source": "proc" },
            { "destination": "/data", "type": "bind", "source": "/srv/data",
              "options": ["bind", "nosuid"] }
        ],
        "hooks": {
            "prestart": [{ "path": "/bin/hook", "args": ["hook", "pre"], "timeout": 5 }]
        },
        "linux": {
            "uidMappings": [{ "containerID": 0, "hostID": 1000, "size": 1 }],
            "devices": [{ "type": "c", "path": "/dev/null", "major": 1, "minor": 3,
                          "fileMode": 438 }],
            "resources": { "devices": [{ "allow": false, "access": "rwm" }] }
        }
    }"#;

    #[test]
    fn parses_consumed_fields_and_ignores_the_rest() {
        let cfg = OciConfig::from_json(CONFIG).expect("parse");
        assert_eq!(cfg.process.user, OciUser { uid: 1000, gid: 1000 });
        assert_eq!(cfg.process.args.len(), 3);
        assert_eq!(cfg.process.capabilities["effective"], ["CAP_NET_ADMIN"]);
        assert_eq!(cfg.process.rlimits[0].rlimit_type, "RLIMIT_NOFILE");
        assert_eq!(cfg.root.path, PathBuf::from("rootfs"));
        assert_eq!(cfg.mounts[1].options, ["bind", "nosuid"]);
        assert_eq!(cfg.hooks.prestart[0].timeout, Some(5));
        assert!(cfg.hooks.poststop.is_empty());
        assert_eq!(cfg.linux.uid_mappings[0].host_id, 1000);
        assert_eq!(cfg.linux.devices[0].file_mode, 0o666);
        assert_eq!(cfg.linux.resources.devices[0].device_type, "a");
        assert_eq!(cfg.linux.resources.devices[0].major, None);
    }

    #[test]
    fn malformed_config_is_a_serialization_error() {
        let err = OciConfig::from_json("{ \"process\": 3 }").expect_err("malformed");
        assert!(matches!(err, VesselError::Serialization { .. }));
    }
}
