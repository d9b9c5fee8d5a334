//! Unified error types for the Vessel workspace.
//!
//! Every fallible operation in the runtime returns [`VesselError`], whose
//! variant identifies which stage of the container lifecycle failed and whose
//! payload carries a human-readable context string.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::HookStage;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum VesselError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value was rejected before any side effect happened.
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Setting up a mount (including its loop or verity device) failed.
    #[error("mount '{name}' failed: {message}")]
    MountFailed {
        /// Name of the mount spec that failed.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// Creating a device node or applying a device rule failed.
    #[error("device setup failed: {message}")]
    DeviceFailed {
        /// Description of the failure.
        message: String,
    },

    /// Creating or configuring the container cgroup failed.
    #[error("cgroup setup failed: {message}")]
    CgroupFailed {
        /// Description of the failure.
        message: String,
    },

    /// Namespace setup or spawning the jailed process failed.
    #[error("jail setup failed: {message}")]
    JailFailed {
        /// Description of the failure.
        message: String,
    },

    /// One or more lifecycle hooks failed.
    #[error("{stage} hooks failed: {message}")]
    HookFailed {
        /// Lifecycle stage whose hooks failed.
        stage: HookStage,
        /// Description of the failure.
        message: String,
    },

    /// An external process did not finish in time.
    #[error("timed out: {message}")]
    Timeout {
        /// Description of what timed out.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The operation is not legal in the container's current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the state violation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl VesselError {
    /// Builds a [`VesselError::ConfigInvalid`] from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Builds a [`VesselError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VesselError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_error_names_the_mount() {
        let err = VesselError::MountFailed {
            name: "data".into(),
            message: "no such file".into(),
        };
        assert_eq!(err.to_string(), "mount 'data' failed: no such file");
    }

    #[test]
    fn hook_error_names_the_stage() {
        let err = VesselError::HookFailed {
            stage: HookStage::Prestart,
            message: "exit status 1".into(),
        };
        assert_eq!(err.to_string(), "prestart hooks failed: exit status 1");
    }
}
