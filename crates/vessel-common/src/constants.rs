//! System-wide constants and default paths.

/// Directory holding the state directories of detached containers.
pub const RUN_CONTAINERS_DIR: &str = "/run/containers";

/// Directory under which non-premounted runfs directories are created.
pub const DEFAULT_RUNDIR: &str = "/run/vessel";

/// Root of the per-subsystem cgroup hierarchies.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Mount table consulted when cleaning up a container directory.
pub const PROC_SELF_MOUNTS: &str = "/proc/self/mounts";

/// File holding the decimal PID of a container's init process.
pub const CONTAINER_PID_FILENAME: &str = "container.pid";

/// OCI bundle configuration file name.
pub const CONFIG_JSON_FILENAME: &str = "config.json";

/// Empty tag file marking a container directory as managed by this runtime.
pub const RUN_OCI_TAG_FILENAME: &str = ".run_oci";

/// Maximum accepted size of a pid file.
///
/// PIDs have at most 8 digits; a newline and some slack round it up.
pub const MAX_PID_FILE_LEN: u64 = 16;

/// Maximum number of rlimits a container may configure.
pub const MAX_RLIMITS: usize = 32;

/// Maximum number of arguments passed to the setfiles helper.
pub const MAX_SETFILES_ARGS: usize = 128;

/// Mode used for mount destinations created on behalf of OCI mounts.
pub const DEFAULT_MOUNT_MODE: u32 = 0o750;

/// OCI runtime-spec version reported to hooks.
pub const OCI_VERSION: &str = "1.0";

/// Annotation carrying the absolute container directory in the hook state.
pub const CONTAINER_ROOT_ANNOTATION: &str = "dev.vessel.container_root";

/// Application name used in logs and synthetic container ids.
pub const APP_NAME: &str = "vessel";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "vessel";
