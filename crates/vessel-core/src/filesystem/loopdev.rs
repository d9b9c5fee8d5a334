//! Loop device attachment.
//!
//! A free device is requested from `/dev/loop-control`, bound to the backing
//! file and marked autoclear so the kernel releases it once the last
//! mount goes away.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use vessel_common::error::{Result, VesselError};

const LOOP_CONTROL: &str = "/dev/loop-control";

const LOOP_SET_FD: u64 = 0x4C00;
const LOOP_CLR_FD: u64 = 0x4C01;
const LOOP_SET_STATUS64: u64 = 0x4C04;
const LOOP_CTL_GET_FREE: u64 = 0x4C82;

const LO_FLAGS_READ_ONLY: u32 = 1;
const LO_FLAGS_AUTOCLEAR: u32 = 4;

/// Attempts before giving up on a device that keeps getting taken.
const ATTACH_RETRIES: usize = 10;

/// `struct loop_info64` from `<linux/loop.h>`.
#[allow(dead_code)]
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; 64],
    lo_crypt_name: [u8; 64],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn new(backing: &Path, flags: u32) -> Self {
        let mut info = Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: flags,
            lo_file_name: [0; 64],
            lo_crypt_name: [0; 64],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        };
        let name = backing.as_os_str().as_encoded_bytes();
        let len = name.len().min(info.lo_file_name.len() - 1);
        info.lo_file_name[..len].copy_from_slice(&name[..len]);
        info
    }
}

fn ioctl(file: &File, request: u64, arg: libc::c_ulong) -> std::io::Result<libc::c_int> {
    // SAFETY: the loop ioctls used here take either an integer argument or a
    // pointer to a live `LoopInfo64`; `file` stays open for the call.
    #[allow(clippy::cast_possible_truncation)]
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as libc::Ioctl, arg) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn open_backing(source: &Path) -> Result<(File, bool)> {
    match OpenOptions::new().read(true).write(true).open(source) {
        Ok(f) => Ok((f, false)),
        Err(e) if matches!(e.raw_os_error(), Some(libc::EROFS | libc::EACCES)) => {
            let f = File::open(source).map_err(|e| VesselError::io(source, e))?;
            Ok((f, true))
        }
        Err(e) => Err(VesselError::io(source, e)),
    }
}

/// Binds `source` to a free loop device and returns the device path.
///
/// # Errors
///
/// Returns an error if the backing file or loop control device cannot be
/// opened, or if no free device could be bound.
pub fn attach(source: &Path) -> Result<PathBuf> {
    let (backing, read_only) = open_backing(source)?;
    let control = File::open(LOOP_CONTROL).map_err(|e| VesselError::io(LOOP_CONTROL, e))?;

    for _ in 0..ATTACH_RETRIES {
        let num = ioctl(&control, LOOP_CTL_GET_FREE, 0)
            .map_err(|e| VesselError::io(LOOP_CONTROL, e))?;
        let path = PathBuf::from(format!("/dev/loop{num}"));
        let device = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| VesselError::io(&path, e))?;

        #[allow(clippy::cast_sign_loss)]
        match ioctl(&device, LOOP_SET_FD, backing.as_raw_fd() as libc::c_ulong) {
            Ok(_) => {}
            // Raced with another attacher; ask for a new free device.
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => continue,
            Err(e) => return Err(VesselError::io(&path, e)),
        }

        let mut flags = LO_FLAGS_AUTOCLEAR;
        if read_only {
            flags |= LO_FLAGS_READ_ONLY;
        }
        let info = LoopInfo64::new(source, flags);
        if let Err(e) = ioctl(&device, LOOP_SET_STATUS64, (&raw const info) as libc::c_ulong) {
            let _ = ioctl(&device, LOOP_CLR_FD, 0);
            return Err(VesselError::io(&path, e));
        }

        tracing::debug!(source = %source.display(), device = %path.display(), read_only, "loop device attached");
        return Ok(path);
    }

    Err(VesselError::io(
        source,
        std::io::Error::other("no free loop device after retries"),
    ))
}

/// Unbinds the loop device at `device`.
///
/// # Errors
///
/// Returns an error if the device cannot be opened or `LOOP_CLR_FD` fails.
pub fn detach(device: &Path) -> Result<()> {
    let file = File::open(device).map_err(|e| VesselError::io(device, e))?;
    let _ = ioctl(&file, LOOP_CLR_FD, 0).map_err(|e| VesselError::io(device, e))?;
    tracing::debug!(device = %device.display(), "loop device detached");
    Ok(())
}
