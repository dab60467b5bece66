//! Kernel pseudo-filesystem access
//!
//! A [`Vfs`] is a handle on a mounted pseudo-filesystem (`/proc`, `/sys`, a
//! cgroup hierarchy). Control files are read and written as whole lines of
//! whitespace separated text, which is how the kernel exposes them.

pub mod mounts;

use crate::{NsboxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub use self::mounts::{MountTable, mounts};

/// Entries a mounted procfs always carries (`self` and `sys` are directories)
const PROCFS_ENTRIES: &[&str] = &["cmdline", "cpuinfo", "meminfo", "mounts", "self", "sys"];
const PROCFS_DIRS: &[&str] = &["self", "sys"];

/// Directories a mounted sysfs always carries
const SYSFS_DIRS: &[&str] = &["bus", "class", "dev", "devices", "fs"];

/// A mounted (or plain) directory exposing kernel state as text files.
///
/// Built from a `/proc/mounts` line, or as a bare mountpoint when the path
/// is not itself a mountpoint. Immutable once built; it does not re-check
/// that the mountpoint still exists on every access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vfs {
    pub device: String,
    pub mountpoint: PathBuf,
    pub filesystem: String,
    pub options: Vec<String>,
}

impl Vfs {
    /// Open `path`, filling in mount details if it is listed in `/proc/mounts`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_dir(path.as_ref())?;
        let table = MountTable::read()?;
        Ok(Self::from_table(path, &table))
    }

    /// Open `path`, looking mount details up in an existing snapshot
    pub fn open_in(path: impl AsRef<Path>, table: &MountTable) -> Result<Self> {
        let path = resolve_dir(path.as_ref())?;
        Ok(Self::from_table(path, table))
    }

    /// Handle on `/proc` without consulting the mount table
    #[must_use]
    pub fn procfs() -> Self {
        Self::bare("/proc")
    }

    /// Handle on `/sys` without consulting the mount table
    #[must_use]
    pub fn sysfs() -> Self {
        Self::bare("/sys")
    }

    /// A handle carrying only a mountpoint
    #[must_use]
    pub fn bare(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            device: String::new(),
            mountpoint: mountpoint.into(),
            filesystem: String::new(),
            options: Vec::new(),
        }
    }

    fn from_table(path: PathBuf, table: &MountTable) -> Self {
        table.get(&path).cloned().unwrap_or_else(|| {
            tracing::trace!(path = %path.display(), "not a mountpoint");
            Self::bare(path)
        })
    }

    /// Where this filesystem is mounted
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.mountpoint
    }

    /// Absolute path of a file relative to this filesystem's root
    #[must_use]
    pub fn join(&self, file: impl AsRef<Path>) -> PathBuf {
        self.mountpoint.join(file)
    }

    /// Whether the standard procfs entries are present
    #[must_use]
    pub fn is_procfs(&self) -> bool {
        PROCFS_ENTRIES.iter().all(|e| self.join(e).exists())
            && PROCFS_DIRS.iter().all(|d| self.join(d).is_dir())
    }

    #[must_use]
    pub fn is_sysfs(&self) -> bool {
        SYSFS_DIRS.iter().all(|d| self.join(d).is_dir())
    }

    /// Whether this is a per-controller cgroup layout.
    ///
    /// `tmpfs` qualifies when it holds `cpuset/tasks` (the systemd layout). A
    /// `cgroup` mount must carry a top-level `tasks` file; one without is a
    /// broken mount and reported as an error rather than `false`. Every other
    /// filesystem type is unsupported.
    pub fn is_cgroupfs(&self) -> Result<bool> {
        match self.filesystem.as_str() {
            "tmpfs" => Ok(self.join("cpuset").join("tasks").is_file()),
            "cgroup" => {
                if self.join("tasks").is_file() {
                    Ok(true)
                } else {
                    Err(NsboxError::InvalidCgroupMount(self.mountpoint.clone()))
                }
            }
            other => Err(NsboxError::UnsupportedFilesystem {
                path: self.mountpoint.clone(),
                fstype: other.to_string(),
            }),
        }
    }

    /// Read a file as a string, minus its trailing newline
    ///
    /// e.g. `procfs.get_string("sys/kernel/ostype")` = `"Linux"`
    pub fn get_string(&self, file: impl AsRef<Path>) -> Result<String> {
        let mut text = self.read(file.as_ref())?;
        if text.ends_with('\n') {
            text.pop();
        }
        Ok(text)
    }

    /// Read the first integer in a file
    ///
    /// e.g. `procfs.get_int("sys/vm/dirty_ratio")` = `10`
    pub fn get_int(&self, file: impl AsRef<Path>) -> Result<i64> {
        let file = file.as_ref();
        self.read(file)?
            .lines()
            .find_map(|line| line.split_whitespace().next()?.parse().ok())
            .ok_or_else(|| NsboxError::Parse {
                path: self.join(file),
                line: 1,
                reason: "no integer value".into(),
            })
    }

    /// Read every integer token in a file, skipping anything non-numeric
    ///
    /// e.g. `cgroupfs.get_int_list("memory/tasks")` = `[1, 200, ...]`
    pub fn get_int_list(&self, file: impl AsRef<Path>) -> Result<Vec<i64>> {
        Ok(self
            .read(file.as_ref())?
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect())
    }

    /// Read a table keyed by the token at `key_index` on each line.
    ///
    /// The value is the full token list of the line, key included. A later
    /// line with the same key replaces an earlier one; lines too short to
    /// have a key are skipped.
    pub fn get_map_list(
        &self,
        file: impl AsRef<Path>,
        key_index: usize,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut map = BTreeMap::new();
        for line in self.read(file.as_ref())?.lines() {
            let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if let Some(key) = parts.get(key_index) {
                map.insert(key.clone(), parts);
            }
        }
        Ok(map)
    }

    /// Replace the contents of a file with `value` and a newline
    pub fn set_string(&self, file: impl AsRef<Path>, value: &str) -> Result<()> {
        let path = self.join(file);
        tracing::debug!(path = %path.display(), value, "writing control file");
        std::fs::write(&path, format!("{value}\n")).map_err(|e| NsboxError::io(path, e))
    }

    /// Write `value` and a newline at the end of a file in one write.
    ///
    /// Kernel membership files (`tasks`, `cgroup.procs`) take one ID per
    /// write and add it; they are never truncated.
    pub fn append_string(&self, file: impl AsRef<Path>, value: &str) -> Result<()> {
        let path = self.join(file);
        tracing::debug!(path = %path.display(), value, "appending to control file");

        let mut handle = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| NsboxError::io(&path, e))?;
        handle
            .write_all(format!("{value}\n").as_bytes())
            .map_err(|e| NsboxError::io(&path, e))
    }

    fn read(&self, file: &Path) -> Result<String> {
        let path = self.join(file);
        std::fs::read_to_string(&path).map_err(|e| NsboxError::io(path, e))
    }
}

impl std::fmt::Display for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mountpoint.display())?;
        if !self.filesystem.is_empty() {
            write!(f, " ({} on {})", self.filesystem, self.device)?;
        }
        Ok(())
    }
}

fn resolve_dir(path: &Path) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(path).map_err(|e| NsboxError::io(path, e))?;
    if resolved.is_dir() {
        Ok(resolved)
    } else {
        Err(NsboxError::NotADirectory(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn table_with(mountpoint: &Path, fstype: &str) -> MountTable {
        let text = format!("{fstype} {} {fstype} rw,relatime 0 0\n", mountpoint.display());
        MountTable::parse("test", &text).unwrap()
    }

    #[test]
    fn open_missing_path_is_not_found() {
        let err = Vfs::open("/0abc1def2ghi3jkl4mno5pqr6stu7vwx8yz9").unwrap_err();
        assert!(matches!(err, NsboxError::NotFound(_)), "{err}");
    }

    #[test]
    fn open_regular_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, "x").unwrap();
        assert!(matches!(Vfs::open(&file), Err(NsboxError::NotADirectory(_))));
    }

    #[test]
    fn open_plain_directory_gives_bare_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Vfs::open(tmp.path()).unwrap();
        assert_eq!(vfs.path(), fs::canonicalize(tmp.path()).unwrap());
        assert!(vfs.filesystem.is_empty());
        assert!(vfs.options.is_empty());
    }

    #[test]
    fn open_in_fills_mount_details() {
        let tmp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let vfs = Vfs::open_in(&root, &table_with(&root, "tmpfs")).unwrap();
        assert_eq!(vfs.filesystem, "tmpfs");
        assert_eq!(vfs.options, vec!["rw", "relatime"]);
    }

    #[test]
    fn string_and_int_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Vfs::open(tmp.path()).unwrap();

        assert!(matches!(vfs.get_string("foo"), Err(NsboxError::NotFound(_))));

        vfs.set_string("int1", "9999").unwrap();
        assert_eq!(vfs.get_string("int1").unwrap(), "9999");
        assert_eq!(vfs.get_int("int1").unwrap(), 9999);

        vfs.set_string("int1", "12").unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("int1")).unwrap(), "12\n");
    }

    #[test]
    fn get_int_skips_leading_junk() {
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Vfs::open(tmp.path()).unwrap();
        vfs.set_string("n", "# comment\n\n42 extra").unwrap();
        assert_eq!(vfs.get_int("n").unwrap(), 42);

        vfs.set_string("n", "max").unwrap();
        assert!(matches!(vfs.get_int("n"), Err(NsboxError::Parse { .. })));
    }

    #[test]
    fn int_list_keeps_order_and_skips_junk() {
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Vfs::open(tmp.path()).unwrap();
        vfs.set_string("tasks", "123\n456\n789").unwrap();
        assert_eq!(vfs.get_int_list("tasks").unwrap(), vec![123, 456, 789]);

        vfs.set_string("tasks", "1\nfoo\n\n2").unwrap();
        assert_eq!(vfs.get_int_list("tasks").unwrap(), vec![1, 2]);
    }

    #[test]
    fn map_list_keys_on_requested_column() {
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Vfs::open(tmp.path()).unwrap();
        vfs.set_string(
            "mounts",
            "proc /proc proc rw 0 0\nsysfs /sys sysfs rw 0 0\ntmpfs /sys tmpfs ro 0 0",
        )
        .unwrap();

        let map = vfs.get_map_list("mounts", 1).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["/proc"], vec!["proc", "/proc", "proc", "rw", "0", "0"]);
        assert_eq!(map["/sys"][0], "tmpfs");
    }

    #[test]
    fn append_accumulates_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let vfs = Vfs::open(tmp.path()).unwrap();
        vfs.set_string("tasks", "1").unwrap();
        vfs.append_string("tasks", "2").unwrap();
        vfs.append_string("tasks", "3").unwrap();
        assert_eq!(vfs.get_int_list("tasks").unwrap(), vec![1, 2, 3]);

        assert!(matches!(
            vfs.append_string("missing/tasks", "4"),
            Err(NsboxError::NotFound(_))
        ));
    }

    #[test]
    fn classifies_proc_and_sys() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Vfs::open(tmp.path()).unwrap();
        assert!(!fake.is_procfs());
        assert!(!fake.is_sysfs());

        for dir in SYSFS_DIRS {
            fs::create_dir(tmp.path().join(dir)).unwrap();
        }
        assert!(fake.is_sysfs());

        assert!(Vfs::procfs().is_procfs());
        assert!(!Vfs::procfs().is_sysfs());
    }

    #[test]
    fn tmpfs_cgroup_needs_cpuset_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let vfs = Vfs::open_in(&root, &table_with(&root, "tmpfs")).unwrap();
        assert!(!vfs.is_cgroupfs().unwrap());

        fs::create_dir(root.join("cpuset")).unwrap();
        fs::write(root.join("cpuset/tasks"), "").unwrap();
        assert!(vfs.is_cgroupfs().unwrap());
    }

    #[test]
    fn cgroup_mount_without_tasks_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let vfs = Vfs::open_in(&root, &table_with(&root, "cgroup")).unwrap();
        assert!(matches!(vfs.is_cgroupfs(), Err(NsboxError::InvalidCgroupMount(_))));

        fs::write(root.join("tasks"), "").unwrap();
        assert!(vfs.is_cgroupfs().unwrap());
    }

    #[test]
    fn other_filesystems_are_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let vfs = Vfs::open_in(&root, &table_with(&root, "ext4")).unwrap();
        assert!(matches!(
            vfs.is_cgroupfs(),
            Err(NsboxError::UnsupportedFilesystem { fstype, .. }) if fstype == "ext4"
        ));
    }
}
