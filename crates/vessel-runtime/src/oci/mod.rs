//! Runs OCI bundles.
//!
//! `run` keeps the container in the foreground and returns its exit status.
//! `start` detaches once the container is up; the container is then driven
//! through its state directory with [`oci_kill`] and [`oci_destroy`].

pub mod hooks;
pub mod spec;
pub mod state;
pub mod translate;

use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::{Pid, getgid, getuid};

use vessel_common::config::RuntimeConfig;
use vessel_common::constants::CONFIG_JSON_FILENAME;
use vessel_common::defer::Deferred;
use vessel_common::error::{Result, VesselError};
use vessel_common::types::HookStage;
use vessel_core::jail::HookEvent;
use vessel_core::process::{self, ExitStatus};

use crate::container::Container;

use self::spec::OciConfig;

/// Command-line adjustments applied on top of a bundle's `config.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Extra `(outside, inside)` bind mounts.
    pub bind_mounts: Vec<(PathBuf, PathBuf)>,
    /// Parent cgroup of the container's cgroups.
    pub cgroup_parent: Option<String>,
    /// Alt-syscall table the program runs under.
    pub alt_syscall_table: Option<String>,
    /// Securebits left unlocked when capabilities are restricted.
    pub securebits_skip_mask: u64,
    /// Map only the invoking user and group, as root inside.
    pub use_current_user: bool,
    /// Run the program as pid 1 of its pid namespace.
    pub run_as_init: bool,
    /// Appended to the bundle's `process.args`.
    pub extra_program_args: Vec<String>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            bind_mounts: Vec::new(),
            cgroup_parent: None,
            alt_syscall_table: None,
            securebits_skip_mask: 0,
            use_current_user: false,
            run_as_init: true,
            extra_program_args: Vec::new(),
        }
    }
}

/// How [`run_oci`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The container keeps running with this init pid.
    Detached(Pid),
    /// The container ran in the foreground and exited.
    Exited(ExitStatus),
}

/// Parses a signal name such as `TERM`, `SIGKILL` or `CLD`.
///
/// # Errors
///
/// Returns [`VesselError::ConfigInvalid`] for unknown names.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    let bare = if bare == "CLD" { "CHLD" } else { bare };
    Signal::from_str(&format!("SIG{bare}"))
        .map_err(|_| VesselError::config(format!("invalid signal name '{name}'")))
}

/// Creates and starts the container described by `bundle_dir`.
///
/// In foreground mode the bundle doubles as the container directory and the
/// call returns once the container has exited and been torn down. With
/// `detach`, the container directory is `<run_containers_dir>/<id>`, which
/// must be the bundle itself (`inplace`); it is tagged, receives the init
/// pid, and is removed again if anything fails before the container is up.
///
/// Prestart hooks run while the program is parked right before `execve(2)`;
/// a failing one kills the program and fails the start. Poststart hooks run
/// once it was released; their failures are only logged. Poststop hooks run
/// when a foreground container exits, and for a detached one only from
/// [`oci_destroy`].
///
/// # Errors
///
/// Returns [`VesselError::ConfigInvalid`] for an unusable bundle or option
/// combination, [`VesselError::HookFailed`] if a prestart hook failed, and
/// any error of
/// [`Container::start`] or [`Container::wait`].
pub fn run_oci(
    bundle_dir: &Path,
    container_id: &str,
    opts: &ContainerOptions,
    inplace: bool,
    detach: bool,
    runtime: &RuntimeConfig,
) -> Result<RunOutcome> {
    let oci = OciConfig::from_file(&bundle_dir.join(CONFIG_JSON_FILENAME))?;

    let container_dir = if detach {
        let dir = runtime.container_dir(container_id);
        if !inplace {
            return Err(VesselError::config("detaching without --inplace is not supported"));
        }
        if dir != bundle_dir {
            return Err(VesselError::config(format!(
                "with --inplace, config.json must live in {}",
                dir.display()
            )));
        }
        dir
    } else {
        bundle_dir.to_path_buf()
    };

    let mounts_file = runtime.mounts_file.clone();
    let tracked = detach.then(|| container_dir.clone());
    let mut cleanup = Deferred::new(tracked, move |dir: &mut Option<PathBuf>| {
        if let Some(dir) = dir.take() {
            let _ = state::cleanup_container(&dir, &mounts_file);
        }
    });
    if detach {
        state::write_tag(&container_dir)?;
    }

    let mut config = translate::config_from_oci(&oci, &container_dir, &opts.extra_program_args)?;
    translate::append_bind_mounts(&mut config, &opts.bind_mounts)?;
    config.keep_fds_open();

    if !oci.hooks.prestart.is_empty() {
        let prestart = oci.hooks.prestart.clone();
        let bundle = bundle_dir.to_path_buf();
        let dir = container_dir.clone();
        config.add_hook(
            HookEvent::PreExecve,
            Arc::new(move |pid| {
                hooks::run_hooks(&prestart, HookStage::Prestart, pid, &bundle, &dir)
            }),
        );
    }

    if let Some(parent) = &opts.cgroup_parent {
        let (uid, gid) = (config.uid(), config.gid());
        config.set_cgroup_parent(parent, uid, gid);
    }
    if opts.use_current_user {
        config.uid_map(&format!("0 {} 1", getuid()))?;
        config.gid_map(&format!("0 {} 1", getgid()))?;
    }
    if let Some(table) = &opts.alt_syscall_table {
        config.alt_syscall_table(table);
    }
    if opts.securebits_skip_mask != 0 {
        config.set_securebits_skip_mask(opts.securebits_skip_mask);
    }
    config.set_run_as_init(opts.run_as_init);

    let name = if oci.hostname.is_empty() {
        container_id
    } else {
        oci.hostname.as_str()
    };
    let mut container = Container::new(name, &runtime.rundir);
    container.set_cgroup_root(&runtime.cgroup_root);
    container.start(&config)?;
    let pid = container
        .pid()
        .ok_or_else(|| VesselError::InvalidState {
            message: "started container has no init pid".into(),
        })?;

    if detach {
        if let Err(e) = state::write_container_pid(&container_dir, pid) {
            kill_quietly(&mut container);
            return Err(e);
        }
    }

    let mut poststop = Deferred::new((), |_: &mut ()| {
        hooks::run_poststop_hooks(&oci.hooks.poststop, pid, bundle_dir, &container_dir);
    });

    if let Err(e) = hooks::run_hooks(
        &oci.hooks.poststart,
        HookStage::Poststart,
        pid,
        bundle_dir,
        &container_dir,
    ) {
        tracing::error!(error = %e, "poststart hooks failed, container keeps running");
    }

    if detach {
        poststop.disarm();
        cleanup.disarm();
        tracing::info!(id = container_id, %pid, "container detached");
        container.detach();
        return Ok(RunOutcome::Detached(pid));
    }

    let status = container.wait()?;
    tracing::info!(name = container.name(), ?status, "container exited");
    Ok(RunOutcome::Exited(status))
}

fn kill_quietly(container: &mut Container) {
    if let Err(e) = container.kill() {
        tracing::error!(error = %e, "failed to kill container");
    }
}

/// Sends `signal` to the init of detached container `container_id`.
/// Poststop hooks are left to [`oci_destroy`].
///
/// # Errors
///
/// Returns [`VesselError::NotFound`] if the container is not managed by this
/// runtime, [`VesselError::Io`] or [`VesselError::InvalidState`] if its pid
/// cannot be read, or [`VesselError::JailFailed`] if the signal cannot be
/// delivered.
pub fn oci_kill(container_id: &str, signal: Signal, runtime: &RuntimeConfig) -> Result<()> {
    let pid = state::read_container_pid(&runtime.container_dir(container_id))?;
    process::send_signal(pid, signal).map_err(|e| VesselError::JailFailed {
        message: format!("sending {signal} to {pid}: {e}"),
    })?;
    tracing::info!(id = container_id, %pid, %signal, "signal sent");
    Ok(())
}

/// Runs the poststop hooks of detached container `container_id` and removes
/// its state directory. The container's init must be gone.
///
/// # Errors
///
/// Returns [`VesselError::InvalidState`] if the init is still running, or
/// the errors of reading the pid and `config.json`.
pub fn oci_destroy(container_id: &str, runtime: &RuntimeConfig) -> Result<()> {
    let container_dir = runtime.container_dir(container_id);
    let pid = state::read_container_pid(&container_dir)?;
    let config_file = container_dir.join(CONFIG_JSON_FILENAME);
    let oci = OciConfig::from_file(&config_file)?;

    if process::is_alive(pid) {
        return Err(VesselError::InvalidState {
            message: format!("container {container_id} is still running as {pid}"),
        });
    }

    let bundle_dir = state::bundle_path(&config_file).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cannot resolve bundle, using container directory");
        container_dir.clone()
    });
    hooks::run_poststop_hooks(&oci.hooks.poststop, pid, &bundle_dir, &container_dir);

    if !state::cleanup_container(&container_dir, &runtime.mounts_file) {
        tracing::warn!(id = container_id, "container cleanup incomplete");
    }
    tracing::info!(id = container_id, "container destroyed");
    Ok(())
}
