//! CLI command definitions and dispatch.

pub mod destroy;
pub mod kill;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use vessel_common::config::RuntimeConfig;
use vessel_common::constants;

/// Vessel: runs OCI bundles in Linux containers.
#[derive(Parser, Debug)]
#[command(name = constants::BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Directory holding the state of detached containers.
    #[arg(long, global = true, env = "VESSEL_STATE_DIR", default_value = constants::RUN_CONTAINERS_DIR)]
    pub state_dir: PathBuf,

    /// Root of the cgroup v1 hierarchies.
    #[arg(long, global = true, env = "VESSEL_CGROUP_ROOT", default_value = constants::CGROUP_ROOT)]
    pub cgroup_root: PathBuf,
}

impl Cli {
    /// Host paths selected on the command line.
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            run_containers_dir: self.state_dir.clone(),
            cgroup_root: self.cgroup_root.clone(),
            ..RuntimeConfig::default()
        }
    }
}

/// Format of log lines on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and run a container in the foreground until its init exits.
    Run(run::RunArgs),
    /// Create and run a container in the background.
    Start(run::StartArgs),
    /// Send a signal to a detached container's init. Runs no hooks.
    Kill(kill::KillArgs),
    /// Run the poststop hooks of a stopped container and free its resources.
    Destroy(destroy::DestroyArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let runtime = cli.runtime_config();
    match cli.command {
        Command::Run(args) => run::execute_run(&args, &runtime),
        Command::Start(args) => run::execute_start(&args, &runtime),
        Command::Kill(args) => kill::execute(&args, &runtime),
        Command::Destroy(args) => destroy::execute(&args, &runtime),
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vessel").chain(args.iter().copied()))
            .expect("parse")
    }

    #[test]
    fn run_collects_options_and_trailing_args() {
        let cli = parse(&[
            "run",
            "-c",
            "/bundle",
            "-b",
            "/srv/data:/data",
            "-B",
            "0x2f",
            "--use-current-user",
            "--dont-run-as-init",
            "web",
            "--",
            "--port",
            "80",
        ]);
        assert!(matches!(cli.command, Command::Run(_)));
        let Command::Run(args) = cli.command else {
            return;
        };
        assert_eq!(args.id, "web");
        assert_eq!(args.options.container_path, Some(PathBuf::from("/bundle")));
        assert_eq!(
            args.options.bind_mount,
            [(PathBuf::from("/srv/data"), PathBuf::from("/data"))]
        );
        assert_eq!(args.options.securebits_skip_mask, 0x2f);
        assert!(args.options.use_current_user);
        assert!(args.options.dont_run_as_init);
        assert_eq!(args.extra_args, ["--port", "80"]);
    }

    #[test]
    fn malformed_bind_mount_is_rejected() {
        let err = Cli::try_parse_from(["vessel", "run", "-b", "/only-outside", "web"]);
        assert!(err.is_err());
        let err = Cli::try_parse_from(["vessel", "run", "-b", ":/inside", "web"]);
        assert!(err.is_err());
    }

    #[test]
    fn kill_defaults_to_term() {
        let cli = parse(&["kill", "web"]);
        assert!(matches!(cli.command, Command::Kill(_)));
        let Command::Kill(args) = cli.command else {
            return;
        };
        assert_eq!(args.signal, Signal::SIGTERM);

        let cli = parse(&["kill", "-S", "KILL", "web"]);
        assert!(matches!(cli.command, Command::Kill(_)));
        let Command::Kill(args) = cli.command else {
            return;
        };
        assert_eq!(args.signal, Signal::SIGKILL);
    }

    #[test]
    fn unknown_signal_is_rejected() {
        assert!(Cli::try_parse_from(["vessel", "kill", "-S", "NOPE", "web"]).is_err());
    }

    #[test]
    fn state_dir_feeds_the_runtime_config() {
        let cli = parse(&["--state-dir", "/tmp/state", "destroy", "web"]);
        let runtime = cli.runtime_config();
        assert_eq!(runtime.container_dir("web"), PathBuf::from("/tmp/state/web"));
        assert_eq!(runtime.cgroup_root, PathBuf::from(constants::CGROUP_ROOT));
    }
}
