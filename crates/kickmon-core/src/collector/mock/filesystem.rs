//! In-memory mock filesystem for testing collectors without a real `/proc`.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

/// In-memory filesystem holding files, directories and symlinks.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
    links: HashMap<PathBuf, PathBuf>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content. Parent directories are created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Adds a symbolic link pointing at `target`.
    pub fn add_link(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.links.insert(path, target.as_ref().to_path_buf());
    }

    /// Removes a file, simulating a view that became unreadable.
    pub fn remove_file(&mut self, path: impl AsRef<Path>) {
        self.files.remove(path.as_ref());
    }

    /// Adds a process with its `stat`, `status` and `io` views.
    ///
    /// Empty strings leave the corresponding view absent.
    pub fn add_process(&mut self, pid: u32, stat: &str, status: &str, io: &str) {
        let base = PathBuf::from(format!("/proc/{}", pid));
        self.add_dir(&base);
        for (name, content) in [("stat", stat), ("status", status), ("io", io)] {
            if !content.is_empty() {
                self.add_file(base.join(name), content);
            }
        }
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
            || self.directories.contains(path)
            || self.links.contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let children = self
            .files
            .keys()
            .chain(self.links.keys())
            .chain(self.directories.iter().filter(|d| d.as_path() != path))
            .filter(|p| p.parent().is_some_and(|parent| parent == path))
            .cloned()
            .collect::<HashSet<_>>();

        Ok(children.into_iter().collect())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.links.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("link not found: {:?}", path),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_add_file() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/1/status", "Name:\tinit\n");

        assert!(fs.exists(Path::new("/proc/1/status")));
        assert!(fs.exists(Path::new("/proc/1")));
        assert!(fs.exists(Path::new("/proc")));
        assert_eq!(
            fs.read_to_string(Path::new("/proc/1/status")).unwrap(),
            "Name:\tinit\n"
        );
    }

    #[test]
    fn test_mock_fs_read_dir_includes_links() {
        let mut fs = MockFs::new();
        fs.add_link("/proc/self/fd/0", "/dev/null");
        fs.add_link("/proc/self/fd/3", "/tmp/data");
        fs.add_file("/proc/self/stat", "x");

        assert_eq!(fs.read_dir(Path::new("/proc/self/fd")).unwrap().len(), 2);
        assert_eq!(fs.read_dir(Path::new("/proc/self")).unwrap().len(), 2);
        assert_eq!(
            fs.read_link(Path::new("/proc/self/fd/3")).unwrap(),
            PathBuf::from("/tmp/data")
        );
    }

    #[test]
    fn test_mock_fs_add_process_skips_empty_views() {
        let mut fs = MockFs::new();
        fs.add_process(42, "stat", "status", "");

        assert!(fs.exists(Path::new("/proc/42/stat")));
        assert!(fs.exists(Path::new("/proc/42/status")));
        assert!(!fs.exists(Path::new("/proc/42/io")));
    }

    #[test]
    fn test_mock_fs_not_found() {
        let fs = MockFs::new();
        assert!(fs.read_to_string(Path::new("/nope")).is_err());
        assert!(fs.read_dir(Path::new("/nope")).is_err());
        assert!(fs.read_link(Path::new("/nope")).is_err());
    }
}
