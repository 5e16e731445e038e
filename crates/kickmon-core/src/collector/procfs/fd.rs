//! Enumeration of a process's already-open descriptors.

use std::path::{Path, PathBuf};

use crate::collector::traits::FileSystem;

/// An open descriptor and what it points at, as seen in `/proc/[pid]/fd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDescriptor {
    pub fd: i32,
    pub target: PathBuf,
}

/// Lists the open descriptors under `fd_dir` (e.g. `/proc/self/fd`), sorted
/// by number. Entries whose link vanished while listing are skipped.
pub fn list_open_descriptors(fs: &impl FileSystem, fd_dir: &Path) -> Vec<OpenDescriptor> {
    let Ok(entries) = fs.read_dir(fd_dir) else {
        return Vec::new();
    };

    let mut found: Vec<OpenDescriptor> = entries
        .into_iter()
        .filter_map(|entry| {
            let fd = entry.file_name()?.to_str()?.parse::<i32>().ok()?;
            let target = fs.read_link(&entry).ok()?;
            Some(OpenDescriptor { fd, target })
        })
        .collect();

    found.sort_by_key(|d| d.fd);
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_list_open_descriptors() {
        let mut fs = MockFs::new();
        fs.add_link("/proc/self/fd/3", "/data/input.txt");
        fs.add_link("/proc/self/fd/0", "/dev/pts/0");
        fs.add_link("/proc/self/fd/5", "socket:[12345]");

        let fds = list_open_descriptors(&fs, Path::new("/proc/self/fd"));
        let numbers: Vec<i32> = fds.iter().map(|d| d.fd).collect();
        assert_eq!(numbers, vec![0, 3, 5]);
        assert_eq!(fds[1].target, PathBuf::from("/data/input.txt"));
    }

    #[test]
    fn test_list_open_descriptors_missing_dir() {
        let fs = MockFs::new();
        assert!(list_open_descriptors(&fs, Path::new("/proc/self/fd")).is_empty());
    }
}
