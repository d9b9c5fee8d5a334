//! OCI lifecycle hooks.
//!
//! Each hook is an external program that receives the container state as
//! JSON on stdin. A hook fails if it exits non-zero or outlives its timeout.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use serde::Serialize;

use vessel_common::constants::{APP_NAME, CONTAINER_ROOT_ANNOTATION, OCI_VERSION};
use vessel_common::error::{Result, VesselError};
use vessel_common::types::HookStage;

use super::spec::OciHook;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Container state handed to hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Runtime-spec version.
    pub oci_version: String,
    /// Synthetic id derived from the init pid.
    pub id: String,
    /// `created`, `running` or `stopped`.
    pub status: String,
    /// Absolute bundle directory.
    pub bundle: PathBuf,
    /// Init pid.
    pub pid: i32,
    /// Holds the absolute container directory.
    pub annotations: BTreeMap<String, String>,
}

impl ContainerState {
    /// State of the container whose init is `pid`, as seen by hooks of
    /// `stage`.
    #[must_use]
    pub fn new(pid: Pid, bundle_dir: &Path, container_dir: &Path, stage: HookStage) -> Self {
        let mut annotations = BTreeMap::new();
        let _ = annotations.insert(
            CONTAINER_ROOT_ANNOTATION.to_owned(),
            absolute(container_dir).display().to_string(),
        );
        Self {
            oci_version: OCI_VERSION.to_owned(),
            id: format!("{APP_NAME}:{pid}"),
            status: stage.status().to_owned(),
            bundle: absolute(bundle_dir),
            pid: pid.as_raw(),
            annotations,
        }
    }

    /// Pretty-printed JSON, so shell hooks can grep individual fields.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::Serialization`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Runs one hook with `state` on its stdin.
///
/// `argv[0]` is always the hook's path. A non-empty `env` replaces the
/// whole environment. Stderr is inherited.
///
/// # Errors
///
/// Returns [`VesselError::Timeout`] if the hook outlived its timeout (it is
/// killed), or [`VesselError::HookFailed`] if it could not be started or
/// exited unsuccessfully.
pub fn run_one_hook(hook: &OciHook, stage: HookStage, state: &str) -> Result<()> {
    let failed = |message: String| VesselError::HookFailed { stage, message };

    let mut command = Command::new(&hook.path);
    let _ = command
        .args(hook.args.iter().skip(1))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    if !hook.env.is_empty() {
        let _ = command.env_clear().envs(hook.env.iter().filter_map(|kv| kv.split_once('=')));
    }

    tracing::debug!(%stage, path = %hook.path.display(), "running hook");
    let mut child = command
        .spawn()
        .map_err(|e| failed(format!("starting {}: {e}", hook.path.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(state.as_bytes()) {
            tracing::error!(%stage, path = %hook.path.display(), error = %e, "failed to send container state");
        }
    }

    let status = match hook.timeout {
        Some(secs) => wait_with_timeout(&mut child, Duration::from_secs(secs)),
        None => child.wait().map(Some),
    }
    .map_err(|e| failed(format!("waiting for {}: {e}", hook.path.display())))?;

    match status {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(failed(format!("{} exited with {status}", hook.path.display()))),
        None => {
            if let Err(e) = child.kill() {
                tracing::error!(%stage, path = %hook.path.display(), error = %e, "failed to kill hook");
            }
            let _ = child.wait();
            Err(VesselError::Timeout {
                message: format!("{stage} hook {}", hook.path.display()),
            })
        }
    }
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Runs every hook of `stage`, in order, even after a failure.
///
/// # Errors
///
/// Returns [`VesselError::HookFailed`] naming how many hooks failed. Each
/// failure is logged.
pub fn run_hooks(
    hooks: &[OciHook],
    stage: HookStage,
    pid: Pid,
    bundle_dir: &Path,
    container_dir: &Path,
) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }
    let state = ContainerState::new(pid, bundle_dir, container_dir, stage).to_json()?;
    let mut failures = 0usize;
    for hook in hooks {
        if let Err(e) = run_one_hook(hook, stage, &state) {
            tracing::error!(%stage, error = %e, "hook failed");
            failures += 1;
        }
    }
    if failures == 0 {
        Ok(())
    } else {
        Err(VesselError::HookFailed {
            stage,
            message: format!("{failures} of {} hooks failed", hooks.len()),
        })
    }
}

/// Runs the poststop hooks. The container is already gone, so failures are
/// only logged.
pub fn run_poststop_hooks(hooks: &[OciHook], pid: Pid, bundle_dir: &Path, container_dir: &Path) {
    if let Err(e) = run_hooks(hooks, HookStage::Poststop, pid, bundle_dir, container_dir) {
        tracing::warn!(error = %e, "error running poststop hooks");
    }
}
