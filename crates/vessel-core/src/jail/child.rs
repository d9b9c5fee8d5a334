//! Jailed child setup between `clone(2)` and `execve(2)`.
//!
//! Nothing here logs; failures surface as the child's exit status.

use std::collections::HashSet;
use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::signal::{SigSet, SigmaskHow, sigprocmask};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid};

use super::{HookEvent, Jail, JailMount};
use crate::filesystem::pivot_root::pivot_root;
use crate::sync::RendezvousFds;

/// Exit status for any jail setup failure.
const EXIT_JAIL_FAILURE: i32 = 253;
/// Exit status when the program exists but cannot be executed.
const EXIT_NO_ACCESS: i32 = 126;
/// Exit status when the program does not exist.
const EXIT_NOT_FOUND: i32 = 127;

/// `prctl` option selecting an alternate syscall table.
const PR_ALT_SYSCALL: libc::c_int = 0x4372_4f53;
const PR_ALT_SYSCALL_SET_SYSCALL_TABLE: libc::c_ulong = 1;

pub(super) fn run(jail: &mut Jail, sync: RendezvousFds, argv: &[CString]) -> ! {
    let code = match setup(jail, sync) {
        Ok(()) => exec(argv),
        Err(_) => EXIT_JAIL_FAILURE,
    };
    // SAFETY: leaves the cloned child without unwinding into the parent's
    // stack frames or running its atexit handlers.
    unsafe { libc::_exit(code) }
}

fn exec(argv: &[CString]) -> i32 {
    let Some(program) = argv.first() else {
        return EXIT_JAIL_FAILURE;
    };
    match nix::unistd::execv(program, argv) {
        Ok(never) => match never {},
        Err(Errno::ENOENT | Errno::ENOTDIR) => EXIT_NOT_FOUND,
        Err(Errno::EACCES | Errno::EPERM | Errno::ENOEXEC) => EXIT_NO_ACCESS,
        Err(_) => EXIT_JAIL_FAILURE,
    }
}

fn setup(jail: &mut Jail, sync: RendezvousFds) -> io::Result<()> {
    sync.wait()?;

    if jail.namespaces.cgroup {
        nix::sched::unshare(CloneFlags::CLONE_NEWCGROUP)?;
    }
    if !jail.run_as_init && jail.namespaces.pid {
        become_init_or_continue()?;
    }

    if jail.namespaces.mount {
        if jail.remount_private {
            nix::mount::mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
        }
        let root = jail.root.clone();
        for m in &jail.mounts {
            mount_in_namespace(root.as_deref(), m)?;
        }
    }

    run_hooks(jail, HookEvent::PreChroot)?;

    if let Some(root) = &jail.root {
        pivot_root(root)?;
    }

    if let Some(table) = &jail.alt_syscall {
        // SAFETY: `table` is a NUL-terminated string alive for the call.
        let ret = unsafe {
            libc::prctl(
                PR_ALT_SYSCALL,
                PR_ALT_SYSCALL_SET_SYSCALL_TABLE,
                table.as_ptr(),
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    for limit in &jail.rlimits {
        let rlim = libc::rlimit {
            rlim_cur: limit.cur,
            rlim_max: limit.max,
        };
        // SAFETY: `rlim` is a valid rlimit struct for the duration of the
        // call.
        #[allow(clippy::cast_sign_loss)]
        let ret = unsafe { libc::setrlimit(limit.resource as _, &raw const rlim) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    change_credentials(jail)?;

    run_hooks(jail, HookEvent::PreDropCaps)?;

    if let Some(caps) = jail.caps {
        caps.apply()?;
    }

    setup_fds(jail)?;

    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;

    run_hooks(jail, HookEvent::PreExecve)
}

fn run_hooks(jail: &mut Jail, event: HookEvent) -> io::Result<()> {
    for (ev, hook) in &mut jail.hooks {
        if *ev == event {
            hook()?;
        }
    }
    Ok(())
}

/// Forks; the parent becomes the namespace's init and never returns, the
/// child continues setting up the program.
fn become_init_or_continue() -> io::Result<()> {
    // SAFETY: the jailed child is single-threaded at this point.
    match unsafe { nix::unistd::fork() }? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => {
            // Drop every inherited descriptor so rendezvous pipes see EOF
            // if the program side dies before signalling.
            // SAFETY: close_range(2) only closes descriptors.
            let _ = unsafe { libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, 0u32) };
            let code = loop {
                match waitpid(None::<Pid>, None) {
                    Ok(WaitStatus::Exited(pid, code)) if pid == child => break code,
                    Ok(WaitStatus::Signaled(pid, sig, _)) if pid == child => {
                        break 128 + sig as i32;
                    }
                    Err(Errno::ECHILD) => break EXIT_JAIL_FAILURE,
                    _ => {}
                }
            };
            // SAFETY: see `run`.
            unsafe { libc::_exit(code) }
        }
    }
}

fn mount_in_namespace(root: Option<&Path>, m: &JailMount) -> io::Result<()> {
    let relative = m.destination.strip_prefix("/").unwrap_or(&m.destination);
    let target: PathBuf = root.map_or_else(|| m.destination.clone(), |r| r.join(relative));

    if m.create && !target.exists() {
        let is_file = std::fs::metadata(&m.source)
            .is_ok_and(|md| !md.is_dir() && !md.file_type().is_block_device());
        if is_file {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let _ = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&target)?;
        } else {
            std::fs::create_dir_all(&target)?;
        }
    }

    let bind_ro = m.flags.contains(MsFlags::MS_BIND | MsFlags::MS_RDONLY);
    let flags = if bind_ro {
        m.flags - MsFlags::MS_RDONLY
    } else {
        m.flags
    };
    nix::mount::mount(
        Some(m.source.as_path()),
        &target,
        m.fstype.as_deref(),
        flags,
        m.data.as_deref(),
    )?;
    if bind_ro {
        nix::mount::mount(
            Some(m.source.as_path()),
            &target,
            m.fstype.as_deref(),
            flags | MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT,
            m.data.as_deref(),
        )?;
    }
    Ok(())
}

fn change_credentials(jail: &Jail) -> io::Result<()> {
    if jail.uid.is_none() && jail.gid.is_none() {
        return Ok(());
    }
    if jail.caps.is_some() {
        // SAFETY: integer-only prctl option.
        let ret = unsafe {
            libc::prctl(
                libc::PR_SET_KEEPCAPS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(gid) = jail.gid {
        if !jail.deny_setgroups {
            nix::unistd::setgroups(&[gid])?;
        }
        nix::unistd::setresgid(gid, gid, gid)?;
    }
    if let Some(uid) = jail.uid {
        nix::unistd::setresuid(uid, uid, uid)?;
    }
    Ok(())
}

fn setup_fds(jail: &Jail) -> io::Result<()> {
    let mut keep: HashSet<RawFd> = HashSet::from([0, 1, 2]);
    for &(parent_fd, child_fd) in &jail.preserved_fds {
        if parent_fd == child_fd {
            // SAFETY: clearing FD_CLOEXEC on a descriptor we own.
            if unsafe { libc::fcntl(child_fd, libc::F_SETFD, 0) } != 0 {
                return Err(io::Error::last_os_error());
            }
        } else {
            // SAFETY: dup2 onto the requested slot; the result is inherited
            // without FD_CLOEXEC.
            if unsafe { libc::dup2(parent_fd, child_fd) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        let _ = keep.insert(child_fd);
    }

    if !jail.close_open_fds {
        return Ok(());
    }
    let mut keep: Vec<RawFd> = keep.into_iter().collect();
    keep.sort_unstable();
    match close_gaps(&keep) {
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => close_listed(&keep)?,
        other => other?,
    }
    Ok(())
}

/// Closes every descriptor not in the sorted `keep` list with
/// `close_range(2)`.
#[allow(clippy::cast_sign_loss)]
fn close_gaps(keep: &[RawFd]) -> io::Result<()> {
    let close_range = |first: u32, last: u32| {
        // SAFETY: close_range(2) only closes descriptors.
        let ret = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0u32) };
        if ret == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    };
    let mut next = 0u32;
    for &fd in keep {
        let fd = fd as u32;
        if fd > next {
            close_range(next, fd - 1)?;
        }
        next = fd + 1;
    }
    close_range(next, u32::MAX)
}

/// Fallback for kernels without `close_range(2)`. Needs `/proc`.
fn close_listed(keep: &[RawFd]) -> io::Result<()> {
    let open: Vec<RawFd> = std::fs::read_dir("/proc/self/fd")?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    for fd in open.into_iter().filter(|fd| !keep.contains(fd)) {
        // SAFETY: closing descriptors this process owns; the directory
        // handle used for listing is already closed.
        let _ = unsafe { libc::close(fd) };
    }
    Ok(())
}
