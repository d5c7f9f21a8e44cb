//! Shared fixtures of the `shader-cache` tests.

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::Context as _;
use tempfile::TempDir;

/// A disposable directory tree of shader sources.
///
/// Dropping it removes the tree, except when a test is unwinding, so the sources
/// of a failed test stay around for debugging.
#[must_use]
pub struct ShaderDir(TempDir);

impl ShaderDir {
    /// Creates an empty tree.
    ///
    /// # Panics
    ///
    /// Panics if no temporary directory can be created.
    #[inline]
    pub fn new() -> Self {
        #[expect(clippy::unwrap_used, reason = "fixture for tests only")]
        Self(TempDir::with_prefix("shader-cache-test").unwrap())
    }

    /// Canonical root of the tree.
    ///
    /// # Panics
    ///
    /// Panics if the root cannot be canonicalized.
    #[inline]
    #[must_use]
    pub fn path(&self) -> PathBuf {
        #[expect(clippy::unwrap_used, reason = "fixture for tests only")]
        dunce::canonicalize(self.0.path()).unwrap()
    }

    /// Writes a file below the root, creating parent directories, and returns its
    /// canonical path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[inline]
    pub fn write(&self, relative: impl AsRef<Path>, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        Ok(dunce::canonicalize(&path)?)
    }

    /// Rewrites a file and moves its modification time into the future, so staleness
    /// checks notice the change even on file systems with coarse timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[inline]
    pub fn touch(&self, relative: impl AsRef<Path>, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.write(relative, contents)?;
        let file = fs::File::options()
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .with_context(|| format!("setting mtime of {}", path.display()))?;
        Ok(path)
    }

    /// Removes a file below the root.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    #[inline]
    pub fn remove(&self, relative: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = self.path().join(relative);
        fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))
    }
}

impl Default for ShaderDir {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShaderDir {
    #[inline]
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.disable_cleanup(true);
        }
    }
}
