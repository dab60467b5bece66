//! # nsbox-core
//!
//! Linux process isolation primitives.
//!
//! This crate provides the layer that talks to the kernel directly:
//! - `/proc`, `/sys` and cgroup control files as line-oriented text ([`vfs`])
//! - per-controller cgroups: discovery, creation, membership, removal
//! - clone(2) into fresh mount/PID/UTS/IPC namespaces under a fork lock
//! - chroot confinement and exec handoff ([`launch`])
//!
//! Nothing here terminates the host process; fatal conditions come back as
//! [`NsboxError`] and the caller decides what to do.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod isolation;
pub mod launch;
pub mod vfs;

pub use config::LaunchConfig;
pub use error::NsboxError;
pub use launch::{LaunchOutcome, Launcher, launch};
pub use vfs::{MountTable, Vfs};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, NsboxError>;
