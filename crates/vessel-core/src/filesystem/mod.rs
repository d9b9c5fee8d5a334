//! Filesystem management for container isolation.
//!
//! Provides mount helpers, loop and dm-verity block devices, `pivot_root`
//! for switching the root filesystem, and mount table parsing.

pub mod loopdev;
pub mod mount;
pub mod mountinfo;
pub mod pivot_root;
pub mod verity;
