//! Scratch directories holding storage files.

#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A scratch directory for one test's storages, removed on drop.
///
/// Storages named `name` keep a `name.header` file next to `name.000000`, `name.000001`
/// and so on; [`header_path`](Self::header_path) and [`segment_path`](Self::segment_path)
/// build those paths so tests can damage them.
///
/// ```
/// use arbor_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// assert_eq!(dir.header_path("index"), dir.path().join("index.header"));
/// assert_eq!(dir.segment_path("values", 2), dir.path().join("values.000002"));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: TempDir::new().expect("failed to create scratch directory") }
    }

    /// Directory to pass as a store's `root_dir`.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Header file of the storage `name`.
    #[must_use]
    pub fn header_path(&self, name: &str) -> PathBuf {
        self.join(format!("{name}.header"))
    }

    /// Segment file `index` of the storage `name`.
    #[must_use]
    pub fn segment_path(&self, name: &str, index: u64) -> PathBuf {
        self.join(format!("{name}.{index:06}"))
    }

    /// Sorted names of the regular files in the directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be listed.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.path())
            .expect("failed to list scratch directory")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
