//! `vessel run` and `vessel start`: run an OCI bundle.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Args;
use vessel_common::config::RuntimeConfig;
use vessel_runtime::oci::{self, ContainerOptions, RunOutcome};

/// Options shared by `run` and `start`.
#[derive(Args, Debug)]
pub struct ContainerArgs {
    /// Bundle directory holding config.json. Defaults to the current
    /// directory.
    #[arg(short = 'c', long)]
    pub container_path: Option<PathBuf>,

    /// Bind mount OUTSIDE:INSIDE into the container. Repeatable.
    #[arg(short = 'b', long, value_name = "OUTSIDE:INSIDE", value_parser = parse_bind_mount)]
    pub bind_mount: Vec<(PathBuf, PathBuf)>,

    /// Parent cgroup of the container.
    #[arg(short = 'p', long)]
    pub cgroup_parent: Option<String>,

    /// Alt-syscall table to run the program under.
    #[arg(short = 's', long)]
    pub alt_syscall: Option<String>,

    /// Securebits (hex) left unlocked when restricting capabilities.
    #[arg(short = 'B', long, value_name = "HEX", default_value_t = 0, value_parser = parse_hex)]
    pub securebits_skip_mask: u64,

    /// Map only the current user and group.
    #[arg(short = 'u', long)]
    pub use_current_user: bool,

    /// Do not run the program as the init of its pid namespace.
    #[arg(short = 'i', long)]
    pub dont_run_as_init: bool,
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub options: ContainerArgs,

    /// Container id.
    pub id: String,

    /// Appended to the program's arguments.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub run: RunArgs,

    /// The bundle is the container's state directory, so config.json can
    /// be edited before starting.
    #[arg(long)]
    pub inplace: bool,
}

impl RunArgs {
    fn bundle_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = match &self.options.container_path {
            Some(path) => path.clone(),
            None => std::env::current_dir().context("reading current directory")?,
        };
        std::fs::canonicalize(&dir).with_context(|| format!("resolving {}", dir.display()))
    }

    fn container_options(&self) -> ContainerOptions {
        let opts = &self.options;
        ContainerOptions {
            bind_mounts: opts.bind_mount.clone(),
            cgroup_parent: opts.cgroup_parent.clone(),
            alt_syscall_table: opts.alt_syscall.clone(),
            securebits_skip_mask: opts.securebits_skip_mask,
            use_current_user: opts.use_current_user,
            run_as_init: !opts.dont_run_as_init,
            extra_program_args: self.extra_args.clone(),
        }
    }
}

/// Executes the `run` command. The exit code is the container's.
///
/// # Errors
///
/// Returns an error if the container cannot be started or waited for.
pub fn execute_run(args: &RunArgs, runtime: &RuntimeConfig) -> anyhow::Result<ExitCode> {
    let bundle = args.bundle_dir()?;
    let outcome = oci::run_oci(&bundle, &args.id, &args.container_options(), true, false, runtime)
        .with_context(|| format!("running container {}", args.id))?;
    match outcome {
        RunOutcome::Exited(status) => Ok(ExitCode::from(u8::try_from(status.code()).unwrap_or(1))),
        RunOutcome::Detached(_) => Ok(ExitCode::SUCCESS),
    }
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container cannot be started.
pub fn execute_start(args: &StartArgs, runtime: &RuntimeConfig) -> anyhow::Result<ExitCode> {
    let run = &args.run;
    let bundle = run.bundle_dir()?;
    let outcome = oci::run_oci(&bundle, &run.id, &run.container_options(), args.inplace, true, runtime)
        .with_context(|| format!("starting container {}", run.id))?;
    if let RunOutcome::Detached(pid) = outcome {
        tracing::info!(id = %run.id, %pid, "container started");
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_bind_mount(value: &str) -> Result<(PathBuf, PathBuf), String> {
    let mut parts = value.split(':');
    match (parts.next(), parts.next()) {
        (Some(outside), Some(inside)) if !outside.is_empty() && !inside.is_empty() => {
            Ok((PathBuf::from(outside), PathBuf::from(inside)))
        }
        _ => Err(format!("expected OUTSIDE:INSIDE, got '{value}'")),
    }
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex mask '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_mask_accepts_optional_prefix() {
        assert_eq!(parse_hex("ff"), Ok(0xff));
        assert_eq!(parse_hex("0x10"), Ok(0x10));
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn bind_mount_ignores_fields_after_the_second() {
        assert_eq!(
            parse_bind_mount("/a:/b:ro"),
            Ok((PathBuf::from("/a"), PathBuf::from("/b")))
        );
    }

    #[test]
    fn dont_run_as_init_inverts_the_option() {
        let args = RunArgs {
            options: ContainerArgs {
                container_path: None,
                bind_mount: Vec::new(),
                cgroup_parent: None,
                alt_syscall: Some("android".into()),
                securebits_skip_mask: 0,
                use_current_user: false,
                dont_run_as_init: true,
            },
            id: "web".into(),
            extra_args: vec!["-v".into()],
        };
        let opts = args.container_options();
        assert!(!opts.run_as_init);
        assert_eq!(opts.alt_syscall_table.as_deref(), Some("android"));
        assert_eq!(opts.extra_program_args, ["-v"]);
    }
}
