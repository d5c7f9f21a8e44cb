//! Options of a [`ShaderLoader`](crate::loader::ShaderLoader).
//!
//! A config is usually read from a `shader-cache.toml`, e.g.
//!
//! ```toml
//! include-roots = ["shaders/common", "third_party/glsl"]
//! max-include-depth = 16
//! use-disk-cache = true
//! disk-cache = "target/shader-cache"
//! ```

use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Name of the directory created inside the OS cache directory.
const CACHE_DIR_NAME: &str = "shader-cache";

/// Default limit of nested includes.
pub const DEFAULT_MAX_INCLUDE_DEPTH: usize = 32;

/// Configuration of a loader.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[serde(default, rename_all = "kebab-case")]
#[non_exhaustive]
pub struct CacheConfig {
    /// Directories searched for included headers, in order, after the directory
    /// of the including file.
    #[cfg_attr(feature = "clap", clap(long = "include-root", short = 'I'))]
    pub include_roots: Vec<PathBuf>,

    /// Maximum nesting of includes before preprocessing fails.
    #[cfg_attr(feature = "clap", clap(long, default_value_t = DEFAULT_MAX_INCLUDE_DEPTH))]
    pub max_include_depth: usize,

    /// Persist compiled artifacts across runs.
    #[cfg_attr(feature = "clap", clap(long, action))]
    pub use_disk_cache: bool,

    /// Where to persist compiled artifacts, the OS cache directory if not set.
    #[cfg_attr(feature = "clap", clap(long))]
    pub disk_cache: Option<PathBuf>,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        Self {
            include_roots: Vec::new(),
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            use_disk_cache: false,
            disk_cache: None,
        }
    }
}

impl CacheConfig {
    /// Reads a config from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid config.
    #[inline]
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Directory persisted artifacts go to, or [`None`] if the disk cache is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the disk cache is enabled without an explicit directory
    /// and the OS has no cache directory.
    #[inline]
    pub fn disk_cache_dir(&self) -> Result<Option<PathBuf>, CacheDirError> {
        if !self.use_disk_cache {
            return Ok(None);
        }
        match &self.disk_cache {
            Some(dir) => Ok(Some(dir.clone())),
            None => cache_dir().map(Some),
        }
    }
}

/// An error indicating that a config file could not be loaded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Source of the error.
        source: io::Error,
    },
    /// The file is not a valid config.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path of the file.
        path: PathBuf,
        /// Source of the error.
        source: toml::de::Error,
    },
}

/// Returns the default directory of persisted shader artifacts.
///
/// Possible values by OS are:
/// * Windows: `C:/users/<user>/AppData/Local/shader-cache`
/// * Mac: `~/Library/Caches/shader-cache`
/// * Linux: `~/.cache/shader-cache`
///
/// # Errors
///
/// Fails if there is no cache directory available.
#[inline]
pub fn cache_dir() -> Result<PathBuf, CacheDirError> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().join(CACHE_DIR_NAME))
        .ok_or(CacheDirError(()))
}

/// An error indicating that there is no cache directory available.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not find cache directory")]
pub struct CacheDirError(());
