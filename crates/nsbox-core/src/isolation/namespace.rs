//! Linux namespace selection

use crate::{NsboxError, Result};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Namespaces every isolated child gets
pub const BASE_NAMESPACES: CloneFlags = CloneFlags::CLONE_NEWNS
    .union(CloneFlags::CLONE_NEWPID)
    .union(CloneFlags::CLONE_NEWUTS)
    .union(CloneFlags::CLONE_NEWIPC);

/// Flags that keep filesystem, fd table, IO context or memory shared with
/// the parent. Never valid for an isolated child.
pub const FORBIDDEN_FLAGS: CloneFlags = CloneFlags::CLONE_FS
    .union(CloneFlags::CLONE_FILES)
    .union(CloneFlags::CLONE_IO)
    .union(CloneFlags::CLONE_VM)
    .union(CloneFlags::CLONE_THREAD)
    .union(CloneFlags::CLONE_SIGHAND);

/// Optional namespaces on top of mount/PID/UTS/IPC.
///
/// Network namespaces come up without any interfaces configured, so they
/// are off unless the caller arranges networking itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Create new user namespace
    pub user: bool,
    /// Create new network namespace
    pub net: bool,
}

impl NamespaceConfig {
    /// Extra clone flags beyond [`BASE_NAMESPACES`]
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        flags
    }
}

/// Full flag word for an isolated clone: base namespaces, `extra`, and the
/// SIGCHLD exit signal in the low byte.
pub fn compose(extra: CloneFlags) -> Result<libc::c_ulong> {
    let shared = extra & FORBIDDEN_FLAGS;
    if !shared.is_empty() {
        return Err(NsboxError::ForbiddenFlags(shared));
    }

    Ok(raw(BASE_NAMESPACES | extra) | libc::SIGCHLD as libc::c_ulong)
}

/// The kernel's unsigned view of a flag set
#[must_use]
pub fn raw(flags: CloneFlags) -> libc::c_ulong {
    // CLONE_IO is the top bit of a c_int: reinterpret, don't sign-extend
    libc::c_ulong::from(flags.bits() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_set_always_present() {
        let flags = compose(CloneFlags::empty()).unwrap();
        for ns in [
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWUTS,
            CloneFlags::CLONE_NEWIPC,
        ] {
            assert_ne!(flags & raw(ns), 0, "{ns:?} missing");
        }
        assert_eq!(flags & 0xff, libc::SIGCHLD as libc::c_ulong);
        assert_eq!(flags & raw(CloneFlags::CLONE_NEWNET), 0);
    }

    #[test]
    fn extra_flags_are_ored_in() {
        let extra = NamespaceConfig { user: true, net: true }.to_clone_flags()
            | CloneFlags::CLONE_VFORK;
        let flags = compose(extra).unwrap();
        assert_ne!(flags & raw(CloneFlags::CLONE_NEWUSER), 0);
        assert_ne!(flags & raw(CloneFlags::CLONE_NEWNET), 0);
        assert_ne!(flags & raw(CloneFlags::CLONE_VFORK), 0);
    }

    #[test]
    fn sharing_flags_are_rejected() {
        for bad in [
            CloneFlags::CLONE_FS,
            CloneFlags::CLONE_FILES,
            CloneFlags::CLONE_IO,
            CloneFlags::CLONE_VM | CloneFlags::CLONE_NEWNET,
        ] {
            match compose(bad) {
                Err(NsboxError::ForbiddenFlags(shared)) => {
                    assert!(!shared.is_empty());
                    assert!(!shared.contains(CloneFlags::CLONE_NEWNET));
                }
                other => panic!("expected ForbiddenFlags for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn raw_does_not_sign_extend() {
        assert_eq!(raw(CloneFlags::CLONE_IO), 0x8000_0000);
    }

    #[test]
    fn default_config_adds_nothing() {
        assert!(NamespaceConfig::default().to_clone_flags().is_empty());
    }
}
