//! `vessel destroy`: release a stopped container.

use std::process::ExitCode;

use anyhow::Context as _;
use clap::Args;
use vessel_common::config::RuntimeConfig;
use vessel_runtime::oci;

/// Arguments for the `destroy` command.
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Container id.
    pub id: String,
}

/// Executes the `destroy` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or still running.
pub fn execute(args: &DestroyArgs, runtime: &RuntimeConfig) -> anyhow::Result<ExitCode> {
    oci::oci_destroy(&args.id, runtime)
        .with_context(|| format!("destroying container {}", args.id))?;
    Ok(ExitCode::SUCCESS)
}
