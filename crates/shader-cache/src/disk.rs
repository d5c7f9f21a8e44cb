//! Compiled artifacts persisted between runs.
//!
//! Entries live in a directory per backend identity, so artifacts of one compiler
//! version are never served to another:
//!
//! ```text
//! <root>/<identity>/<content hash>.spv   SPIR-V, little-endian words
//! <root>/<identity>/<content hash>.json  reflection and dependencies
//! ```
//!
//! The `.json` file is written last, an entry without it is incomplete. Nothing in
//! here fails a shader request: unreadable or corrupt entries are misses, and
//! failed writes only lose the entry.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{backend::ReflectionInfo, blob::Blob};

/// Version of the entry layout, bumped whenever it changes.
const FORMAT_VERSION: u32 = 1;

/// Magic number every SPIR-V module starts with.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Metadata stored next to the SPIR-V of an entry.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct EntryMetadata {
    /// Layout version the entry was written with.
    format: u32,
    /// Content hash the entry is stored under.
    content_hash: u64,
    /// Files the artifact was compiled from, for inspection only.
    dependencies: Vec<PathBuf>,
    /// Resource layout.
    reflection: ReflectionInfo,
}

/// An artifact read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct StoredArtifact {
    /// SPIR-V words.
    pub spirv: Vec<u32>,
    /// Resource layout.
    pub reflection: ReflectionInfo,
}

/// An error of a single disk cache operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DiskCacheError {
    /// A file could not be read or written.
    #[error("disk cache io on {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// Source of the error.
        source: io::Error,
    },
    /// Metadata could not be (de)serialized.
    #[error("disk cache metadata {path}: {source}")]
    Json {
        /// The metadata file.
        path: PathBuf,
        /// Source of the error.
        source: serde_json::Error,
    },
    /// The entry does not hold a usable artifact.
    #[error("corrupt disk cache entry {path}: {reason}")]
    Corrupt {
        /// The offending file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
}

/// Persisted artifacts of one backend identity.
#[derive(Debug, Clone)]
pub struct DiskCache {
    /// Directory of this identity's entries.
    dir: PathBuf,
}

impl DiskCache {
    /// Opens the cache of `identity` below `root`. Directories are created lazily.
    #[inline]
    #[must_use]
    pub fn new(root: impl AsRef<Path>, identity: &str) -> Self {
        Self {
            dir: root.as_ref().join(to_dirname(identity)),
        }
    }

    /// Directory of this identity's entries.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry file with the given extension.
    fn entry_path(&self, content_hash: u64, extension: &str) -> PathBuf {
        self.dir.join(format!("{content_hash:016x}.{extension}"))
    }

    /// Reads the artifact of a content hash, [`None`] on any kind of miss.
    #[inline]
    #[must_use]
    pub fn load(&self, content_hash: u64) -> Option<StoredArtifact> {
        match self.try_load(content_hash) {
            Ok(Some(artifact)) => {
                log::debug!("disk cache hit for {content_hash:016x}");
                Some(artifact)
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("ignoring disk cache entry: {err}");
                None
            }
        }
    }

    /// Reads the artifact of a content hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but cannot be read or is corrupt.
    #[inline]
    pub fn try_load(&self, content_hash: u64) -> Result<Option<StoredArtifact>, DiskCacheError> {
        let json_path = self.entry_path(content_hash, "json");
        let json = match fs::read(&json_path) {
            Ok(json) => json,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DiskCacheError::Io {
                    path: json_path,
                    source,
                })
            }
        };
        let metadata: EntryMetadata =
            serde_json::from_slice(&json).map_err(|source| DiskCacheError::Json {
                path: json_path.clone(),
                source,
            })?;
        if metadata.format != FORMAT_VERSION || metadata.content_hash != content_hash {
            return Err(DiskCacheError::Corrupt {
                path: json_path,
                reason: format!(
                    "written as {:016x} with format {}",
                    metadata.content_hash, metadata.format
                ),
            });
        }

        let spv_path = self.entry_path(content_hash, "spv");
        let bytes = fs::read(&spv_path).map_err(|source| DiskCacheError::Io {
            path: spv_path.clone(),
            source,
        })?;
        let spirv = words_from_bytes(&bytes).map_err(|reason| DiskCacheError::Corrupt {
            path: spv_path,
            reason,
        })?;
        Ok(Some(StoredArtifact {
            spirv,
            reflection: metadata.reflection,
        }))
    }

    /// Persists a blob, logging instead of failing.
    #[inline]
    pub fn store(&self, blob: &Blob) {
        if let Err(err) = self.try_store(blob) {
            log::warn!("could not persist shader: {err}");
        }
    }

    /// Persists a blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    #[inline]
    pub fn try_store(&self, blob: &Blob) -> Result<(), DiskCacheError> {
        fs::create_dir_all(&self.dir).map_err(|source| DiskCacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let content_hash = blob.content_hash();
        let metadata = EntryMetadata {
            format: FORMAT_VERSION,
            content_hash,
            dependencies: blob.dependencies().to_vec(),
            reflection: blob.reflection().clone(),
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(|source| DiskCacheError::Json {
            path: self.entry_path(content_hash, "json"),
            source,
        })?;
        write_replacing(&self.entry_path(content_hash, "spv"), &blob.spirv_bytes())?;
        write_replacing(&self.entry_path(content_hash, "json"), &json)?;
        log::debug!("persisted {content_hash:016x} to {}", self.dir.display());
        Ok(())
    }

    /// Removes every entry of this identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    #[inline]
    pub fn clear(&self) -> Result<(), DiskCacheError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DiskCacheError::Io {
                path: self.dir.clone(),
                source,
            }),
        }
    }
}

/// Writes a file through a temporary sibling, so readers never see half of it.
fn write_replacing(path: &Path, contents: &[u8]) -> Result<(), DiskCacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|source| DiskCacheError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Decodes little-endian SPIR-V words.
///
/// # Errors
///
/// Returns the reason if the bytes cannot be a SPIR-V module.
#[inline]
#[expect(clippy::indexing_slicing, reason = "chunks are exactly four bytes")]
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, String> {
    if bytes.is_empty() {
        return Err("empty module".to_owned());
    }
    if bytes.len() % 4 != 0 {
        return Err(format!("{} bytes is not a whole number of words", bytes.len()));
    }
    let words = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<_>>();
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(format!("bad magic number {other:#010x}")),
        None => Err("empty module".to_owned()),
    }
}

/// Returns a string suitable to use as a directory name.
fn to_dirname(text: &str) -> String {
    text.replace(
        [std::path::MAIN_SEPARATOR, '\\', '/', '.', ':', '@', '=', ' '],
        "_",
    )
    .split(['{', '}', '\n', '"', '\''])
    .collect::<Vec<_>>()
    .concat()
}

#[cfg(test)]
mod test {
    use shader_cache_test_utils::ShaderDir;

    use super::*;
    use crate::backend::{BindingKind, ResourceBinding};

    fn blob(hash: u64) -> Blob {
        Blob::new(
            hash,
            vec![SPIRV_MAGIC, 0x0001_0000, 7],
            Vec::new(),
            None,
            ReflectionInfo::new(
                vec![ResourceBinding::new(0, 1, BindingKind::Texture, Some("albedo".into()))],
                Vec::new(),
                0,
            ),
        )
    }

    #[test_log::test]
    fn stored_entries_load_back() {
        let dir = ShaderDir::new();
        let cache = DiskCache::new(dir.path(), "naga 23.1");
        assert_eq!(cache.dir(), dir.path().join("naga_23_1"));
        assert_eq!(cache.load(0xabc), None);

        cache.try_store(&blob(0xabc)).unwrap();
        let loaded = cache.try_load(0xabc).unwrap().unwrap();
        assert_eq!(loaded.spirv, blob(0xabc).spirv());
        assert_eq!(&loaded.reflection, blob(0xabc).reflection());
        assert!(cache.dir().join("0000000000000abc.spv").is_file());
    }

    #[test_log::test]
    fn identities_are_isolated() {
        let dir = ShaderDir::new();
        DiskCache::new(dir.path(), "compiler-a").store(&blob(1));
        assert_eq!(DiskCache::new(dir.path(), "compiler-b").load(1), None);
        assert!(DiskCache::new(dir.path(), "compiler-a").load(1).is_some());
    }

    #[test_log::test]
    fn corrupt_spirv_is_a_miss() {
        let dir = ShaderDir::new();
        let cache = DiskCache::new(dir.path(), "mock");
        cache.store(&blob(2));
        fs::write(cache.entry_path(2, "spv"), [1, 2, 3]).unwrap();
        assert!(matches!(
            cache.try_load(2),
            Err(DiskCacheError::Corrupt { .. })
        ));
        assert_eq!(cache.load(2), None);
    }

    #[test_log::test]
    fn word_decoding() {
        assert!(words_from_bytes(&[]).is_err());
        assert!(words_from_bytes(&[3, 2, 35]).is_err());
        assert!(words_from_bytes(&[0, 0, 0, 0]).is_err());
        assert_eq!(
            words_from_bytes(&[0x03, 0x02, 0x23, 0x07, 1, 0, 0, 0]).unwrap(),
            [SPIRV_MAGIC, 1]
        );
    }

    #[test_log::test]
    fn clear_removes_the_identity_directory() {
        let dir = ShaderDir::new();
        let cache = DiskCache::new(dir.path(), "mock");
        cache.store(&blob(3));
        cache.clear().unwrap();
        assert!(!cache.dir().exists());
        cache.clear().unwrap();
    }
}
