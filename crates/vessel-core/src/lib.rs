//! # vessel-core
//!
//! Low-level Linux isolation primitives for the Vessel runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: selection, joining, and user namespace id maps.
//! - **Cgroups v1**: per-subsystem hierarchies, CPU bandwidth, device rules.
//! - **Filesystem**: mounts, loop devices, dm-verity, `pivot_root`, and mount
//!   table parsing.
//! - **Capabilities**: bounding/effective/ambient sets and securebits.
//! - **Jail**: the cloned child that applies all of the above and executes
//!   the contained program.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod device;
pub mod filesystem;
pub mod jail;
pub mod namespace;
pub mod process;
pub mod sync;
