//! Context-independent compiled artifacts, addressed by content hash.

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use crate::{
    backend::ReflectionInfo, error::Error, flight::FlightMap, hash::ContentHasher, key::Key,
    preprocess::modified,
};

/// Computes the content hash of a preprocessed variant.
///
/// Covers the preprocessed text as well as the stage, entry point, options digest
/// and root path of the key, so distinct variants never share an artifact even if
/// their sources expand to the same text.
#[inline]
#[must_use]
pub fn content_hash(preprocessed: &str, key: &Key) -> u64 {
    ContentHasher::new()
        .str(preprocessed)
        .u8(key.stage().ordinal())
        .str(key.entry())
        .u64(key.options_digest())
        .bytes(key.path().as_os_str().as_encoded_bytes())
        .finish()
}

/// An immutable compiled shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Content hash of the input this was compiled from.
    content_hash: u64,
    /// SPIR-V words.
    spirv: Vec<u32>,
    /// Every file read while preprocessing, root first.
    dependencies: Vec<PathBuf>,
    /// Newest modification time among the dependencies, as read by the preprocessor.
    newest_timestamp: Option<SystemTime>,
    /// Resource layout.
    reflection: ReflectionInfo,
}

impl Blob {
    /// Creates a blob.
    ///
    /// `newest_timestamp` must be the newest modification time of the dependencies
    /// observed before they were read, so that edits made while compiling still
    /// make the blob stale.
    #[inline]
    #[must_use]
    pub const fn new(
        content_hash: u64,
        spirv: Vec<u32>,
        dependencies: Vec<PathBuf>,
        newest_timestamp: Option<SystemTime>,
        reflection: ReflectionInfo,
    ) -> Self {
        Self {
            content_hash,
            spirv,
            dependencies,
            newest_timestamp,
            reflection,
        }
    }

    /// Content hash the blob is stored under.
    #[inline]
    #[must_use]
    pub const fn content_hash(&self) -> u64 {
        self.content_hash
    }

    /// SPIR-V words.
    #[inline]
    #[must_use]
    pub fn spirv(&self) -> &[u32] {
        &self.spirv
    }

    /// SPIR-V as little-endian bytes, the layout of a `.spv` file.
    #[inline]
    #[must_use]
    pub fn spirv_bytes(&self) -> Vec<u8> {
        self.spirv.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    /// Every file read while preprocessing, root first.
    #[inline]
    #[must_use]
    pub fn dependencies(&self) -> &[PathBuf] {
        &self.dependencies
    }

    /// Newest modification time among the dependencies when they were read.
    #[inline]
    #[must_use]
    pub const fn newest_timestamp(&self) -> Option<SystemTime> {
        self.newest_timestamp
    }

    /// Resource layout.
    #[inline]
    #[must_use]
    pub const fn reflection(&self) -> &ReflectionInfo {
        &self.reflection
    }

    /// Returns `true` if a dependency changed or disappeared since it was read.
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        changed_since(&self.dependencies, self.newest_timestamp)
    }
}

/// Returns `true` if any of `dependencies` is missing or was modified after `newest`.
#[inline]
#[must_use]
pub fn changed_since(dependencies: &[PathBuf], newest: Option<SystemTime>) -> bool {
    dependencies.iter().any(|path| match modified(path) {
        Some(time) => newest.map_or(true, |newest| time > newest),
        None => {
            log::debug!("dependency {} disappeared", path.display());
            true
        }
    })
}

/// Cache of compiled blobs, at most one per content hash.
pub struct BlobCache {
    /// Blobs by content hash.
    blobs: FlightMap<u64, Arc<Blob>>,
}

impl Default for BlobCache {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl BlobCache {
    /// Creates an empty cache.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: FlightMap::new(),
        }
    }

    /// Returns the cached blob of the content hash, creating it with `factory` on a
    /// miss.
    ///
    /// Concurrent calls for the same hash run `factory` once, the others wait and
    /// receive its outcome. A failed `factory` caches nothing.
    ///
    /// # Errors
    ///
    /// Returns the error of `factory`.
    #[inline]
    pub fn lookup_or_insert<F>(&self, content_hash: u64, factory: F) -> Result<Arc<Blob>, Error>
    where
        F: FnOnce() -> Result<Blob, Error>,
    {
        self.blobs.get_or_try_insert_with(&content_hash, || {
            log::debug!("blob cache miss for {content_hash:016x}");
            factory().map(Arc::new)
        })
    }

    /// Returns the cached blob of the content hash.
    #[inline]
    #[must_use]
    pub fn get(&self, content_hash: u64) -> Option<Arc<Blob>> {
        self.blobs.get(&content_hash)
    }

    /// Drops every blob nothing but the cache refers to, returning how many.
    ///
    /// Blobs of live modules or handles are never dropped.
    #[inline]
    pub fn purge_unused(&self) -> usize {
        let purged = self
            .blobs
            .drain_where(|_, blob| Arc::strong_count(blob) == 1)
            .len();
        log::debug!("purged {purged} unused blobs");
        purged
    }

    /// Number of cached blobs.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns `true` if nothing is cached.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
