//! CPU bandwidth control via the v1 `cpu` controller.
//!
//! Manages `cpu.shares`, the CFS quota/period pair, and the realtime
//! runtime/period pair.

use std::path::Path;

use vessel_common::error::{Result, VesselError};

fn write_param(cgroup_path: &Path, file: &str, value: impl ToString) -> Result<()> {
    let path = cgroup_path.join(file);
    std::fs::write(&path, value.to_string()).map_err(|e| VesselError::CgroupFailed {
        message: format!("writing {}: {e}", path.display()),
    })
}

/// Sets the relative CPU weight (shares) for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `cpu.shares` fails.
pub fn set_cpu_shares(cgroup_path: &Path, shares: u64) -> Result<()> {
    write_param(cgroup_path, "cpu.shares", shares)?;
    tracing::debug!(shares, "CPU shares set");
    Ok(())
}

/// Sets the CFS bandwidth limit.
///
/// A quota of `-1` removes the limit. The period is written first so that a
/// quota valid only for the new period is accepted.
///
/// # Errors
///
/// Returns an error if writing to `cpu.cfs_period_us` or
/// `cpu.cfs_quota_us` fails.
pub fn set_cpu_quota(cgroup_path: &Path, quota_us: i64, period_us: u64) -> Result<()> {
    write_param(cgroup_path, "cpu.cfs_period_us", period_us)?;
    write_param(cgroup_path, "cpu.cfs_quota_us", quota_us)?;
    tracing::debug!(quota_us, period_us, "CPU quota set");
    Ok(())
}

/// Sets the realtime scheduling budget.
///
/// The period is written first so that the runtime never exceeds it.
///
/// # Errors
///
/// Returns an error if writing to `cpu.rt_period_us` or `cpu.rt_runtime_us`
/// fails.
pub fn set_cpu_rt(cgroup_path: &Path, runtime_us: u64, period_us: u64) -> Result<()> {
    write_param(cgroup_path, "cpu.rt_period_us", period_us)?;
    write_param(cgroup_path, "cpu.rt_runtime_us", runtime_us)?;
    tracing::debug!(runtime_us, period_us, "CPU realtime budget set");
    Ok(())
}
