//! Mount table resolution
//!
//! Maps a canonical absolute path to the mount point and file-system type
//! it lives on, using the longest mount-point prefix that ends on a path
//! component boundary. The table is parsed from the `/proc/mounts` format.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Mount point and file-system type owning a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub mount_point: String,
    pub fs_type: String,
}

/// Resolves record names to the file system they reside on
pub trait PathResolver {
    fn resolve(&self, path: &str) -> Option<MountInfo>;
}

/// Resolver that knows no mounts
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMounts;

impl PathResolver for NoMounts {
    fn resolve(&self, _path: &str) -> Option<MountInfo> {
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    /// Sorted by mount point length, longest first
    entries: Vec<MountInfo>,
}

impl MountTable {
    pub fn new(entries: Vec<MountInfo>) -> Self {
        let mut entries = entries;
        entries.sort_by(|a, b| b.mount_point.len().cmp(&a.mount_point.len()));
        Self { entries }
    }

    /// Parse `/proc/mounts` content
    ///
    /// Lines have the form `device mount_point fs_type options dump pass`.
    /// Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let _device = fields.next()?;
                let mount_point = fields.next()?;
                let fs_type = fields.next()?;
                Some(MountInfo {
                    mount_point: unescape(mount_point),
                    fs_type: fs_type.to_string(),
                })
            })
            .collect();
        Self::new(entries)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read mount table {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// The running system's mount table
    pub fn system() -> Result<Self> {
        Self::from_file("/proc/mounts")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PathResolver for MountTable {
    fn resolve(&self, path: &str) -> Option<MountInfo> {
        if !path.starts_with('/') {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| on_mount(path, &entry.mount_point))
            .cloned()
    }
}

fn on_mount(path: &str, mount_point: &str) -> bool {
    if mount_point == "/" {
        return true;
    }
    match path.strip_prefix(mount_point) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Undo the octal escapes the kernel applies to mount fields
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
tmpfs /tmp tmpfs rw,nosuid,nodev 0 0
lustre@tcp:/scratch /scratch lustre rw,flock 0 0
/dev/sdb1 /mnt/my\\040data xfs rw 0 0
";

    #[test]
    fn test_longest_prefix_wins() {
        let table = MountTable::parse(SAMPLE);
        let info = table.resolve("/scratch/job/out.dat").unwrap();
        assert_eq!(info.mount_point, "/scratch");
        assert_eq!(info.fs_type, "lustre");

        let info = table.resolve("/home/user/a.txt").unwrap();
        assert_eq!(info.mount_point, "/");
        assert_eq!(info.fs_type, "ext4");
    }

    #[test]
    fn test_component_boundary() {
        let table = MountTable::parse(SAMPLE);
        // "/tmpfoo" shares a prefix with "/tmp" but is not under it
        assert_eq!(table.resolve("/tmpfoo/x").unwrap().mount_point, "/");
        assert_eq!(table.resolve("/tmp").unwrap().mount_point, "/tmp");
    }

    #[test]
    fn test_escaped_mount_point() {
        let table = MountTable::parse(SAMPLE);
        let info = table.resolve("/mnt/my data/file").unwrap();
        assert_eq!(info.mount_point, "/mnt/my data");
        assert_eq!(info.fs_type, "xfs");
    }

    #[test]
    fn test_relative_names_unresolved() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.resolve("relative/file").is_none());
        assert!(NoMounts.resolve("/scratch/x").is_none());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let table = MountTable::parse("garbage\n\n/dev/sda1 /data ext4 rw 0 0\n");
        assert_eq!(table.len(), 1);
        assert!(table.resolve("/other").is_none());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a\\011b"), "a\tb");
        assert_eq!(unescape("a\\134b"), "a\\b");
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn test_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();
        let table = MountTable::from_file(file.path()).unwrap();
        assert_eq!(table.len(), 5);
        assert!(MountTable::from_file("/nonexistent/mounts").is_err());
    }
}
