//! # vessel-runtime
//!
//! Container lifecycle on top of the primitives in `vessel-core`.
//!
//! A [`config::ContainerConfig`] is assembled through validating setters and
//! handed to [`container::Container::start`], which prepares the runfs,
//! performs the mount table, creates the cgroup, device nodes and jail, and
//! spawns the contained program. Every step registers its undo action so a
//! failed start leaves nothing behind. The [`oci`] module drives the same
//! machinery from an OCI bundle and runs the bundle's lifecycle hooks.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod callbacks;
pub mod config;
pub mod container;
pub mod devices;
pub mod mounts;
pub mod oci;
