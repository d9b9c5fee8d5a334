//! `vessel kill`: signal a detached container.

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Args;
use nix::sys::signal::Signal;
use vessel_common::config::RuntimeConfig;
use vessel_runtime::oci;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Signal sent to the container's init, with or without the SIG prefix.
    #[arg(short = 'S', long, default_value = "TERM", value_parser = parse_signal)]
    pub signal: Signal,

    /// Container id.
    pub id: String,
}

/// Executes the `kill` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or cannot be signalled.
pub fn execute(args: &KillArgs, runtime: &RuntimeConfig) -> anyhow::Result<ExitCode> {
    oci::oci_kill(&args.id, args.signal, runtime)
        .with_context(|| format!("killing container {}", args.id))?;
    Ok(ExitCode::SUCCESS)
}

fn parse_signal(value: &str) -> Result<Signal, String> {
    oci::parse_signal(value).map_err(|e| e.to_string())
}
