//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use nix::mount::{MntFlags, MsFlags};

/// Makes `new_root` the root of the calling mount namespace.
///
/// `new_root` is bind-mounted onto itself so it is a mount point, then
/// pivoted with the old root stacked on top of it at `/`, which is detached
/// afterwards. No `put_old` directory is needed.
///
/// Runs in the jailed child between fork and exec, so it does not log.
///
/// # Errors
///
/// Returns the first failing syscall's error.
pub fn pivot_root(new_root: &Path) -> nix::Result<()> {
    nix::mount::mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    nix::unistd::chdir(new_root)?;
    nix::unistd::pivot_root(".", ".")?;
    // Keep unmount events of the old root from propagating to the host.
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    nix::mount::umount2(".", MntFlags::MNT_DETACH)?;
    nix::unistd::chdir("/")
}
