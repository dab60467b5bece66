//! Error types for nsbox-core

use nix::errno::Errno;
use nix::sched::CloneFlags;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NsboxError {
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse error in {} line {line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("unsupported filesystem type {fstype:?} at {}", path.display())]
    UnsupportedFilesystem { path: PathBuf, fstype: String },

    #[error("cgroup mount {} has no tasks file", .0.display())]
    InvalidCgroupMount(PathBuf),

    #[error(
        "found a tasks file in {}: monolithic and single controller mounts are not supported, try /sys/fs/cgroup",
        .0.display()
    )]
    MonolithicMount(PathBuf),

    #[error("kernel support missing: {0}")]
    KernelUnsupported(String),

    #[error("'{}' does not exist, cannot chroot there", .0.display())]
    ChrootMissing(PathBuf),

    #[error("changed directory to {} but chroot failed: {source}", root.display())]
    Confinement { root: PathBuf, source: Errno },

    #[error("clone flags {0:?} would share state with the parent")]
    ForbiddenFlags(CloneFlags),

    #[error(
        "kernel rejected clone flags {0:?} (EINVAL), make sure the kernel configuration includes all CONFIG_*_NS options"
    )]
    UnsupportedNamespaces(CloneFlags),

    #[error("fork failed: {0}")]
    Fork(Errno),

    #[error("wait failed: {0}")]
    Wait(Errno),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl NsboxError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }

    /// Whether the error reflects the host environment rather than a
    /// transient or argument problem. Retrying these is pointless.
    #[must_use]
    pub const fn is_fatal_precondition(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFilesystem { .. }
                | Self::InvalidCgroupMount(_)
                | Self::MonolithicMount(_)
                | Self::KernelUnsupported(_)
                | Self::ChrootMissing(_)
                | Self::Confinement { .. }
                | Self::UnsupportedNamespaces(_)
        )
    }
}
