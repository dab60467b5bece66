//! Filesystem root confinement

use crate::{NsboxError, Result};
use std::path::{Path, PathBuf};

/// Validate `root`, change into it, then make it the process root.
///
/// A missing root and a non-directory root fail before any syscall. If the
/// directory change succeeds but chroot does not, the process is left in
/// the new working directory with its old root; that is reported as
/// [`NsboxError::Confinement`] and there is no rollback.
pub fn chroot_into(root: impl AsRef<Path>) -> Result<PathBuf> {
    let root = validate_root(root.as_ref())?;
    tracing::debug!(root = %root.display(), "chroot");

    nix::unistd::chdir(&root).map_err(|e| NsboxError::Io {
        path: root.clone(),
        source: std::io::Error::from(e),
    })?;

    nix::unistd::chroot(&root).map_err(|source| NsboxError::Confinement {
        root: root.clone(),
        source,
    })?;

    Ok(root)
}

/// Absolute form of `root`, which must be an existing directory
fn validate_root(root: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(root).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => NsboxError::ChrootMissing(root.to_path_buf()),
        _ => NsboxError::Io {
            path: root.to_path_buf(),
            source: e,
        },
    })?;

    if !meta.is_dir() {
        return Err(NsboxError::NotADirectory(root.to_path_buf()));
    }

    // relative roots would otherwise be resolved twice: once by chdir,
    // then again by chroot from inside the new working directory
    std::fs::canonicalize(root).map_err(|e| NsboxError::io(root, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_is_distinct() {
        let err = chroot_into("/0abc1def2ghi3jkl4mno5pqr6stu7vwx8yz9").unwrap_err();
        assert!(matches!(err, NsboxError::ChrootMissing(_)), "{err}");
        assert!(err.is_fatal_precondition());
    }

    #[test]
    fn regular_file_fails_before_changing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("rootfs");
        std::fs::write(&file, "not a tree").unwrap();

        let before = std::env::current_dir().unwrap();
        let err = chroot_into(&file).unwrap_err();
        assert!(matches!(err, NsboxError::NotADirectory(_)), "{err}");
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn roots_are_canonicalized() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = validate_root(tmp.path()).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved, std::fs::canonicalize(tmp.path()).unwrap());
    }
}
