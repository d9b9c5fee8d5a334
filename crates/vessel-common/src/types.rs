//! Domain primitive types used across the Vessel workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// OCI lifecycle stage at which external hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookStage {
    /// After the container process exists, before it executes the program.
    Prestart,
    /// After the program has started.
    Poststart,
    /// After the container process has exited.
    Poststop,
}

impl HookStage {
    /// Container status string reported in the state JSON for this stage.
    #[must_use]
    pub const fn status(self) -> &'static str {
        match self {
            Self::Prestart => "created",
            Self::Poststart => "running",
            Self::Poststop => "stopped",
        }
    }

    /// Stage name as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prestart => "prestart",
            Self::Poststart => "poststart",
            Self::Poststop => "poststop",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a container through its start sequence.
///
/// Phases only move forward during `start`; teardown resets to `TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// Nothing has been set up yet.
    Created,
    /// The runfs is in place and all external mounts succeeded.
    Mounted,
    /// Device rules are applied and device node creation is scheduled.
    DevicesReady,
    /// CPU parameters are applied to the cgroup.
    CgroupReady,
    /// The jailed process has been spawned.
    JailStarted,
    /// All in-namespace callbacks ran; the container is running.
    Running,
    /// The init process has been reaped.
    Exited,
    /// Every resource owned by the container has been released.
    TornDown,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Mounted => "mounted",
            Self::DevicesReady => "devices_ready",
            Self::CgroupReady => "cgroup_ready",
            Self::JailStarted => "jail_started",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_stage_reports_oci_status() {
        assert_eq!(HookStage::Prestart.status(), "created");
        assert_eq!(HookStage::Poststart.status(), "running");
        assert_eq!(HookStage::Poststop.status(), "stopped");
    }

    #[test]
    fn phases_are_ordered() {
        assert!(LifecyclePhase::Mounted < LifecyclePhase::CgroupReady);
        assert!(LifecyclePhase::Running < LifecyclePhase::TornDown);
    }
}
