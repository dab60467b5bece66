//! Linux isolation primitives
//!
//! This module contains the kernel-facing mechanisms:
//! - `cgroups` - per-controller cgroup creation, membership and removal
//! - `namespace` - namespace flag selection for new children
//! - `clone` - clone(2) into fresh namespaces under the fork lock
//! - `chroot` - filesystem root confinement

pub mod cgroups;
pub mod chroot;
pub mod clone;
pub mod namespace;

pub use self::cgroups::{Cgroup, ControllerFailure, find_cgroup_vfs, list_controllers};
pub use self::chroot::chroot_into;
pub use self::clone::fork;
pub use self::namespace::NamespaceConfig;
