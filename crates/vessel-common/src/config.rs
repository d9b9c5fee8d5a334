//! Global configuration model for the Vessel runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Host paths the runtime works with.
///
/// Defaults match a standard Linux host; tests point them at temporary
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding the state directories of detached containers.
    pub run_containers_dir: PathBuf,
    /// Directory under which temporary runfs directories are created.
    pub rundir: PathBuf,
    /// Root of the per-subsystem cgroup hierarchies.
    pub cgroup_root: PathBuf,
    /// Mount table used to find leftover mountpoints during cleanup.
    pub mounts_file: PathBuf,
}

impl RuntimeConfig {
    /// Returns the state directory of the container with the given id.
    #[must_use]
    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.run_containers_dir.join(container_id)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            run_containers_dir: PathBuf::from(constants::RUN_CONTAINERS_DIR),
            rundir: PathBuf::from(constants::DEFAULT_RUNDIR),
            cgroup_root: PathBuf::from(constants::CGROUP_ROOT),
            mounts_file: PathBuf::from(constants::PROC_SELF_MOUNTS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_dir_is_under_run_containers() {
        let cfg = RuntimeConfig::default();
        assert_eq!(
            cfg.container_dir("abc"),
            PathBuf::from("/run/containers/abc")
        );
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = RuntimeConfig {
            run_containers_dir: "/tmp/c".into(),
            ..RuntimeConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: RuntimeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
