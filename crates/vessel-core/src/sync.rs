//! One-shot rendezvous between a supervisor and a forked child.
//!
//! Each side calls exactly one of [`Rendezvous::wait`] or
//! [`Rendezvous::signal`]. Signalling writes a single token byte and closes
//! both pipe ends; waiting closes the local write end and reads. Reading the
//! token means the peer got there; end-of-file without it means every peer
//! holding a write end exited or gave up. Only `read(2)`, `write(2)` and
//! `close(2)` are used, so the child half works between `fork` and
//! `execve`.
//!
//! There is no timeout: a peer that never signals blocks the waiter until it
//! exits.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;

use vessel_common::error::{Result, VesselError};

/// Byte written by the signalling side.
const TOKEN: u8 = b'!';

/// Single-use pipe-based event.
#[derive(Debug)]
pub struct Rendezvous {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Rendezvous {
    /// Creates a new close-on-exec pipe pair.
    ///
    /// # Errors
    ///
    /// Returns an error if `pipe2(2)` fails.
    pub fn new() -> Result<Self> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| {
            VesselError::JailFailed {
                message: format!("failed to create rendezvous pipe: {e}"),
            }
        })?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Raw descriptors, for use in a forked child or for inheritance into
    /// the jailed process.
    #[must_use]
    pub fn fds(&self) -> RendezvousFds {
        RendezvousFds {
            read: self.read.as_ref().map_or(-1, AsRawFd::as_raw_fd),
            write: self.write.as_ref().map_or(-1, AsRawFd::as_raw_fd),
        }
    }

    /// Wakes the waiting peer by writing the token and closing both ends.
    ///
    /// A peer that already exited cannot be woken; that is not an error
    /// here, its waiter sees end-of-file instead.
    pub fn signal(&mut self) {
        drop(self.read.take());
        if let Some(write) = self.write.take() {
            while matches!(
                nix::unistd::write(&write, &[TOKEN]),
                Err(nix::errno::Errno::EINTR)
            ) {}
        }
    }

    /// Blocks until the peer signals.
    ///
    /// # Errors
    ///
    /// Returns [`VesselError::JailFailed`] if every write end was closed
    /// without the token, i.e. the peer died before reaching the rendezvous,
    /// or if `read(2)` fails with anything but `EINTR`. Returns
    /// [`VesselError::InvalidState`] if the rendezvous was already used.
    pub fn wait(&mut self) -> Result<()> {
        drop(self.write.take());
        let Some(read) = self.read.take() else {
            return Err(VesselError::InvalidState {
                message: "rendezvous already consumed".into(),
            });
        };
        let mut buf = [0u8; 1];
        loop {
            match nix::unistd::read(&read, &mut buf) {
                Ok(1) if buf[0] == TOKEN => return Ok(()),
                Ok(_) => {
                    return Err(VesselError::JailFailed {
                        message: "peer exited before reaching the rendezvous".into(),
                    });
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    return Err(VesselError::JailFailed {
                        message: format!("rendezvous read failed: {e}"),
                    });
                }
            }
        }
    }
}

/// Raw descriptors of a [`Rendezvous`] as seen in a forked child.
///
/// Operations go straight to `libc` and never allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousFds {
    /// Read end.
    pub read: RawFd,
    /// Write end.
    pub write: RawFd,
}

impl RendezvousFds {
    /// Child-side [`Rendezvous::signal`].
    pub fn signal(self) {
        let token = TOKEN;
        // SAFETY: both descriptors were inherited from the parent and are
        // owned by this process image; `token` outlives the write. Writing
        // to or closing an invalid fd is harmless.
        unsafe {
            let _ = libc::close(self.read);
            while libc::write(self.write, (&raw const token).cast(), 1) < 0
                && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
            {}
            let _ = libc::close(self.write);
        }
    }

    /// Child-side [`Rendezvous::wait`].
    ///
    /// # Errors
    ///
    /// Returns [`std::io::ErrorKind::UnexpectedEof`] if the peer closed its
    /// end without signalling, or the `read(2)` error other than `EINTR`.
    pub fn wait(self) -> std::io::Result<()> {
        // SAFETY: see `signal`.
        let _ = unsafe { libc::close(self.write) };
        let mut buf = 0u8;
        let result = loop {
            // SAFETY: `buf` is a valid one-byte buffer for the whole call.
            let ret = unsafe { libc::read(self.read, (&raw mut buf).cast(), 1) };
            if ret == 1 && buf == TOKEN {
                break Ok(());
            }
            if ret >= 0 {
                break Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                break Err(err);
            }
        };
        // SAFETY: see `signal`.
        let _ = unsafe { libc::close(self.read) };
        result
    }
}
