//! Mount table parsing (`/proc/mounts`)

use super::Vfs;
use crate::{NsboxError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Location of the kernel mount table
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// A snapshot of the mount table, keyed by mountpoint.
///
/// Mount state can change at any time underneath a running process, so a
/// snapshot is meant to be read, consulted and dropped. Nothing caches it.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: BTreeMap<PathBuf, Vfs>,
}

impl MountTable {
    /// Read the live kernel mount table
    pub fn read() -> Result<Self> {
        Self::load(PROC_MOUNTS)
    }

    /// Read a mount table in `/proc/mounts` format from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| NsboxError::io(path, e))?;
        Self::parse(path, &text)
    }

    /// Parse mount table text. `origin` only labels errors.
    ///
    /// Any malformed line fails the whole parse: a partial table is not
    /// something isolation decisions can be based on.
    pub fn parse(origin: impl AsRef<Path>, text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            let entry = parse_line(line).map_err(|reason| NsboxError::Parse {
                path: origin.as_ref().to_path_buf(),
                line: idx + 1,
                reason,
            })?;

            // later mounts on the same point shadow earlier ones
            entries.insert(entry.mountpoint.clone(), entry);
        }

        tracing::trace!(entries = entries.len(), "parsed mount table");
        Ok(Self { entries })
    }

    /// Entry mounted exactly at `mountpoint`
    #[must_use]
    pub fn get(&self, mountpoint: impl AsRef<Path>) -> Option<&Vfs> {
        self.entries.get(mountpoint.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Vfs)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn into_map(self) -> BTreeMap<PathBuf, Vfs> {
        self.entries
    }
}

/// Parse and return a fresh mountpoint → entry map of the live mount table
pub fn mounts() -> Result<BTreeMap<PathBuf, Vfs>> {
    MountTable::read().map(MountTable::into_map)
}

fn parse_line(line: &str) -> std::result::Result<Vfs, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(format!("expected 6 fields, found {}", fields.len()));
    }

    for (name, value) in [("dump", fields[4]), ("pass", fields[5])] {
        value
            .parse::<u32>()
            .map_err(|e| format!("invalid {name} field {value:?}: {e}"))?;
    }

    Ok(Vfs {
        device: unescape(fields[0]),
        mountpoint: PathBuf::from(unescape(fields[1])),
        filesystem: fields[2].to_string(),
        options: fields[3].split(',').map(str::to_string).collect(),
    })
}

/// Decode the octal escapes the kernel uses for whitespace and backslashes
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value =
                (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}
