//! Linux capability management for least-privilege execution.
//!
//! The jailed child drops every capability outside the configured mask from
//! its bounding, effective, permitted and inheritable sets, optionally raises
//! the mask into the ambient set so it survives `execve(2)` as a non-root
//! user, and locks the securebits not listed in the skip mask.

use vessel_common::error::{Result, VesselError};

/// Kernel capability names, indexed by capability number.
const CAP_NAMES: [&str; 41] = [
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

const SECBIT_NOROOT: u64 = 1 << 0;
const SECBIT_NOROOT_LOCKED: u64 = 1 << 1;
const SECBIT_NO_SETUID_FIXUP: u64 = 1 << 2;
const SECBIT_NO_SETUID_FIXUP_LOCKED: u64 = 1 << 3;
const SECBIT_KEEP_CAPS_LOCKED: u64 = 1 << 5;
const SECBIT_NO_CAP_AMBIENT_RAISE: u64 = 1 << 6;
const SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED: u64 = 1 << 7;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Looks up a capability number by name.
///
/// Accepts `CAP_SYS_ADMIN`, `sys_admin`, and any casing in between.
#[must_use]
pub fn from_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let bare = lower.strip_prefix("cap_").unwrap_or(&lower);
    CAP_NAMES
        .iter()
        .position(|n| *n == bare)
        .and_then(|i| u32::try_from(i).ok())
}

/// Builds a capability bitmask from names.
///
/// # Errors
///
/// Returns [`VesselError::ConfigInvalid`] for an unknown name.
pub fn mask_from_names<I, S>(names: I) -> Result<u64>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().try_fold(0u64, |mask, name| {
        let name = name.as_ref();
        from_name(name)
            .map(|cap| mask | (1u64 << cap))
            .ok_or_else(|| VesselError::config(format!("unknown capability '{name}'")))
    })
}

/// Capability configuration applied in the jailed child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityConfig {
    /// Capabilities to keep.
    pub mask: u64,
    /// Also raise `mask` into the ambient set.
    pub ambient: bool,
    /// Securebits to leave unlocked.
    pub securebits_skip: u64,
}

impl CapabilityConfig {
    /// Securebits locked by [`CapabilityConfig::apply`].
    #[must_use]
    pub const fn securebits(&self) -> u64 {
        let mut bits = SECBIT_NOROOT
            | SECBIT_NOROOT_LOCKED
            | SECBIT_NO_SETUID_FIXUP
            | SECBIT_NO_SETUID_FIXUP_LOCKED
            | SECBIT_KEEP_CAPS_LOCKED;
        if !self.ambient {
            bits |= SECBIT_NO_CAP_AMBIENT_RAISE | SECBIT_NO_CAP_AMBIENT_RAISE_LOCKED;
        }
        bits & !self.securebits_skip
    }

    /// Applies the configuration to the calling thread.
    ///
    /// Runs in the jailed child between fork and exec, so it does not log.
    ///
    /// # Errors
    ///
    /// Returns the first failing `prctl(2)`/`capset(2)` error.
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> std::io::Result<()> {
        // Securebits need CAP_SETPCAP, which capset below may drop.
        prctl(libc::PR_SET_SECUREBITS, self.securebits(), 0)?;

        for cap in 0..64u64 {
            if self.mask & (1 << cap) != 0 {
                continue;
            }
            match prctl(libc::PR_CAPBSET_DROP, cap, 0) {
                Ok(()) => {}
                // Past the last capability the running kernel knows.
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => break,
                Err(e) => return Err(e),
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let (low, high) = (self.mask as u32, (self.mask >> 32) as u32);
        let header = CapHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let data = [
            CapData {
                effective: low,
                permitted: low,
                inheritable: low,
            },
            CapData {
                effective: high,
                permitted: high,
                inheritable: high,
            },
        ];
        // SAFETY: header and data match the kernel's v3 layout and outlive
        // the call.
        let ret = unsafe { libc::syscall(libc::SYS_capset, &raw const header, data.as_ptr()) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }

        if self.ambient {
            for cap in 0..64u64 {
                if self.mask & (1 << cap) != 0 {
                    prctl(
                        libc::PR_CAP_AMBIENT,
                        libc::PR_CAP_AMBIENT_RAISE as u64,
                        cap,
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[allow(dead_code)]
#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[allow(dead_code)]
#[repr(C)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

#[cfg(target_os = "linux")]
fn prctl(option: libc::c_int, arg2: u64, arg3: u64) -> std::io::Result<()> {
    // SAFETY: the options used here take integer arguments only.
    let ret = unsafe { libc::prctl(option, arg2, arg3, 0u64, 0u64) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
