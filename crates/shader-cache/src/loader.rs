//! The live handle registry, entry point of every shader request.
//!
//! A [`ShaderLoader`] answers [`ShaderLoader::get`] from its registry of live handles
//! when it can. On a miss it preprocesses the root file, hashes the result and goes
//! through the blob and module caches, each of which only does work the first time
//! a content hash (or a content hash and context) is seen.
//!
//! Handles carry a version. Re-requesting a key after [`ShaderLoader::invalidate`]
//! keeps the version if the compiled content did not change and bumps it if it did,
//! so callers can cheaply tell whether they need to rebuild dependent state.
//!
//! Invalidating a key while it is being loaded discards the result of that load,
//! which is then redone from the current sources.

use core::fmt;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use parking_lot::Mutex;

use crate::{
    backend::CompilerBackend,
    blob::{changed_since, content_hash, Blob, BlobCache},
    config::{CacheConfig, CacheDirError},
    disk::DiskCache,
    error::Error,
    flight::FlightMap,
    key::{Defines, Key},
    module::{ContextId, Module, ModuleCache, ShaderContext},
    preprocess::{FsIncludeResolver, IncludeResolver, PreprocessedSource, Preprocessor},
};

/// A ready-to-use shader, as returned by [`ShaderLoader::get`].
pub struct Handle<R> {
    /// The module the handle refers to.
    module: Arc<Module<R>>,
    /// Key the handle was requested with.
    key: Key,
    /// Version of the handle.
    version: u64,
    /// Newest modification time of the sources this handle was loaded from.
    newest_timestamp: Option<SystemTime>,
    /// Invalidation epoch of the key when the load started.
    epoch: u64,
}

impl<R> Handle<R> {
    /// The module the handle refers to.
    #[inline]
    #[must_use]
    pub const fn module(&self) -> &Arc<Module<R>> {
        &self.module
    }

    /// Compiled artifact of the module.
    #[inline]
    #[must_use]
    pub fn blob(&self) -> &Arc<Blob> {
        self.module.blob()
    }

    /// The context-resident object.
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &R {
        self.module.resource()
    }

    /// Key the handle was requested with.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> &Key {
        &self.key
    }

    /// Version of the handle, starting at 1.
    #[inline]
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Newest modification time of the sources, as read when the handle was loaded.
    #[inline]
    #[must_use]
    pub const fn newest_timestamp(&self) -> Option<SystemTime> {
        self.newest_timestamp
    }

    /// Returns `true` if a source changed or disappeared since the handle was loaded.
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        changed_since(self.blob().dependencies(), self.newest_timestamp)
    }
}

impl<R> Clone for Handle<R> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            module: Arc::clone(&self.module),
            key: self.key.clone(),
            version: self.version,
            newest_timestamp: self.newest_timestamp,
            epoch: self.epoch,
        }
    }
}

impl<R> PartialEq for Handle<R> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.module, &other.module)
            && self.key == other.key
            && self.version == other.version
    }
}

impl<R> Eq for Handle<R> {}

impl<R> fmt::Debug for Handle<R> {
    #[expect(
        clippy::min_ident_chars,
        reason = "It's a core library trait implementation"
    )]
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("blob_hash", &format_args!("{:016x}", self.module.blob_hash()))
            .field("context", &self.module.context())
            .finish()
    }
}

/// Sizes of the caches of a loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct CacheStats {
    /// Number of cached blobs.
    pub blobs: usize,
    /// Number of cached modules, over all contexts.
    pub modules: usize,
    /// Number of live handles, over all contexts.
    pub live_handles: usize,
    /// Number of times the backend was asked to compile.
    pub compilations: u64,
}

/// A live handle is registered per key and context.
type Slot = (Key, ContextId);

/// Loads of a key currently running.
#[derive(Debug, Default)]
struct Loading {
    /// Bumped by every invalidation of the key.
    epoch: u64,
    /// Number of outstanding [`LoadTicket`]s.
    tickets: usize,
}

/// Keeps the invalidation epoch of a key alive while a request for it is loading.
struct LoadTicket<'loader> {
    /// Loads of the loader.
    loads: &'loader Mutex<HashMap<Key, Loading>>,
    /// Key being loaded.
    key: &'loader Key,
}

impl<'loader> LoadTicket<'loader> {
    /// Registers a load of `key`.
    fn begin(loads: &'loader Mutex<HashMap<Key, Loading>>, key: &'loader Key) -> Self {
        loads.lock().entry(key.clone()).or_default().tickets += 1;
        Self { loads, key }
    }

    /// Returns `false` if the key was invalidated after `handle` started loading.
    fn is_current<R>(&self, handle: &Handle<R>) -> bool {
        self.loads
            .lock()
            .get(self.key)
            .is_some_and(|loading| loading.epoch == handle.epoch)
    }
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        let mut running = self.loads.lock();
        if let Some(loading) = running.get_mut(self.key) {
            loading.tickets -= 1;
            if loading.tickets == 0 {
                running.remove(self.key);
            }
        }
    }
}

/// Produces shader handles, caching every intermediate step.
///
/// `R` is the resource type of the [`ShaderContext`]s the loader serves.
pub struct ShaderLoader<B, R> {
    /// The compiler.
    backend: B,
    /// Include expansion and macro preamble.
    preprocessor: Preprocessor,
    /// Compiled artifacts by content hash.
    blobs: BlobCache,
    /// Context-resident modules by content hash and context.
    modules: ModuleCache<R>,
    /// Live handles.
    live: FlightMap<Slot, Handle<R>>,
    /// Blob hash and version of invalidated handles.
    retired: Mutex<HashMap<Slot, (u64, u64)>>,
    /// Keys being loaded.
    loads: Mutex<HashMap<Key, Loading>>,
    /// Every set of definitions seen so far, by digest.
    known_options: Mutex<HashMap<u64, Defines>>,
    /// Artifacts persisted between runs.
    disk: Option<DiskCache>,
    /// Number of backend compilations.
    compilations: AtomicU64,
}

impl<B: CompilerBackend, R> ShaderLoader<B, R> {
    /// Creates a loader with the default config and no disk cache.
    #[inline]
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self::build(backend, &CacheConfig::default(), None)
    }

    /// Creates a loader from a config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config enables the disk cache without a directory and
    /// the OS has no cache directory.
    #[inline]
    pub fn with_config(backend: B, config: &CacheConfig) -> Result<Self, CacheDirError> {
        let disk = config
            .disk_cache_dir()?
            .map(|dir| DiskCache::new(dir, backend.identity()));
        Ok(Self::build(backend, config, disk))
    }

    /// Shared part of the constructors.
    fn build(backend: B, config: &CacheConfig, disk: Option<DiskCache>) -> Self {
        let resolver = Arc::new(FsIncludeResolver::new(config.include_roots.iter().cloned()));
        let empty = Defines::default();
        if let Some(disk) = &disk {
            log::debug!("persisting shaders to {}", disk.dir().display());
        }
        Self {
            backend,
            preprocessor: Preprocessor::new(resolver, config.max_include_depth),
            blobs: BlobCache::new(),
            modules: ModuleCache::new(),
            live: FlightMap::new(),
            retired: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            known_options: Mutex::new(HashMap::from([(empty.digest(), empty)])),
            disk,
            compilations: AtomicU64::new(0),
        }
    }

    /// Replaces the include resolver, keeping the include depth limit.
    #[inline]
    #[must_use]
    pub fn with_include_resolver(mut self, resolver: Arc<dyn IncludeResolver>) -> Self {
        self.preprocessor = Preprocessor::new(resolver, self.preprocessor.max_include_depth());
        self
    }

    /// The compiler.
    #[inline]
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The preprocessor used on cache misses.
    #[inline]
    #[must_use]
    pub const fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// The blob cache.
    #[inline]
    #[must_use]
    pub const fn blob_cache(&self) -> &BlobCache {
        &self.blobs
    }

    /// The module cache.
    #[inline]
    #[must_use]
    pub const fn module_cache(&self) -> &ModuleCache<R> {
        &self.modules
    }

    /// The disk cache, if enabled.
    #[inline]
    #[must_use]
    pub const fn disk_cache(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    /// Returns the handle of a key in a context.
    ///
    /// The same handle is returned for as long as the key stays registered. Concurrent
    /// requests for the same key and context converge on one handle, and requests
    /// resolving to the same content hash compile it once.
    ///
    /// # Errors
    ///
    /// Returns an error if the shader cannot be preprocessed, compiled, reflected or
    /// realized in the context, or if a definition contains
    /// [`Defines::SEPARATOR`]. Nothing is cached for a failed request.
    #[inline]
    pub fn get<C>(&self, key: &Key, context: &C) -> Result<Handle<R>, Error>
    where
        C: ShaderContext<Resource = R> + ?Sized,
    {
        if let Some(raw) = key
            .defines()
            .and_then(|defines| defines.iter().find(|raw| raw.contains(Defines::SEPARATOR)))
        {
            return Err(Error::preprocess(
                key.path(),
                format!("definition `{}` contains a line break", raw.escape_debug()),
            ));
        }
        let slot = (key.clone(), context.id());
        if let Some(handle) = self.live.get(&slot) {
            log::trace!("live handle hit for {key}");
            return Ok(handle);
        }
        loop {
            let ticket = LoadTicket::begin(&self.loads, key);
            let handle = self
                .live
                .get_or_try_insert_with(&slot, || self.load(&slot, context))?;
            if ticket.is_current(&handle) {
                return Ok(handle);
            }
            log::debug!("{key} was invalidated while loading, loading it again");
            if let Some(discarded) = self.live.remove_if(&slot, |live| *live == handle) {
                self.retire(slot.clone(), &discarded);
            }
        }
    }

    /// Produces a fresh handle for a registry miss.
    fn load<C>(&self, slot: &Slot, context: &C) -> Result<Handle<R>, Error>
    where
        C: ShaderContext<Resource = R> + ?Sized,
    {
        let (key, id) = slot;
        // the caller's ticket keeps the entry alive
        let epoch = self
            .loads
            .lock()
            .get(key)
            .map_or(0, |loading| loading.epoch);
        if let Some(defines) = key.defines() {
            self.known_options
                .lock()
                .entry(key.options_digest())
                .or_insert_with(|| defines.clone());
        }
        let defines = self.defines_of(key)?;
        let source = self.preprocessor.run(key.path(), &defines)?;
        let hash = content_hash(&source.text, key);
        let newest_timestamp = source.newest_timestamp;
        log::debug!("{key} in context {id} resolved to {hash:016x}");

        let blob = self
            .blobs
            .lookup_or_insert(hash, || self.compile(key, hash, source))?;
        let module = self.modules.lookup_or_create(&blob, context)?;

        let version = match self.retired.lock().remove(slot) {
            Some((previous_hash, previous)) if previous_hash == hash => previous,
            Some((_, previous)) => previous + 1,
            None => 1,
        };
        Ok(Handle {
            module,
            key: key.clone(),
            version,
            newest_timestamp,
            epoch,
        })
    }

    /// Definitions of a key, recovered by digest if the key carries none.
    fn defines_of(&self, key: &Key) -> Result<Defines, Error> {
        if let Some(defines) = key.defines() {
            return Ok(defines.clone());
        }
        let digest = key.options_digest();
        self.known_options
            .lock()
            .get(&digest)
            .cloned()
            .ok_or(Error::UnknownOptions { digest })
    }

    /// Builds the blob of a content hash, from disk if possible.
    fn compile(&self, key: &Key, hash: u64, source: PreprocessedSource) -> Result<Blob, Error> {
        if let Some(artifact) = self.disk.as_ref().and_then(|disk| disk.load(hash)) {
            return Ok(Blob::new(
                hash,
                artifact.spirv,
                source.dependencies,
                source.newest_timestamp,
                artifact.reflection,
            ));
        }

        log::info!("compiling {key}");
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let compile_error = |diagnostic: String| Error::Compile {
            path: key.path().to_path_buf(),
            stage: key.stage(),
            entry: key.entry().to_owned(),
            diagnostic,
        };
        let spirv = self
            .backend
            .compile(&source.text, key.stage(), key.entry())
            .map_err(|diagnostic| compile_error(diagnostic.0))?;
        if spirv.is_empty() {
            return Err(compile_error("the compiler produced an empty module".to_owned()));
        }
        let reflection =
            self.backend
                .reflect(&spirv)
                .map_err(|diagnostic| Error::Reflection {
                    content_hash: hash,
                    diagnostic: diagnostic.0,
                })?;

        let blob = Blob::new(
            hash,
            spirv,
            source.dependencies,
            source.newest_timestamp,
            reflection,
        );
        if let Some(disk) = &self.disk {
            disk.store(&blob);
        }
        Ok(blob)
    }

    /// Remembers a removed handle for the version rule.
    fn retire(&self, slot: Slot, handle: &Handle<R>) {
        self.retired
            .lock()
            .insert(slot, (handle.module.blob_hash(), handle.version));
    }

    /// Unregisters the handles of a key in every context.
    ///
    /// Outstanding handles stay valid. The next [`get`](Self::get) of the key produces a
    /// fresh handle, keeping the old version if the content hash is unchanged and
    /// incrementing it otherwise. Loads of the key still running are redone once they
    /// finish. Returns `true` if any handle was registered or being loaded.
    #[inline]
    pub fn invalidate(&self, key: &Key) -> bool {
        // loads check the epoch after registering, so bump it before draining
        let in_flight = match self.loads.lock().get_mut(key) {
            Some(loading) => {
                loading.epoch += 1;
                true
            }
            None => false,
        };
        let removed = self.live.drain_where(|(registered, _), _| registered == key);
        if in_flight {
            log::debug!("invalidated loads of {key} in flight");
        }
        if !removed.is_empty() {
            log::debug!("invalidated {} handles of {key}", removed.len());
        }
        let any = in_flight || !removed.is_empty();
        for (slot, handle) in removed {
            self.retire(slot, &handle);
        }
        any
    }

    /// Invalidates every key whose handle depends on a file that changed or
    /// disappeared since the handle was loaded, returning those keys.
    #[inline]
    pub fn invalidate_stale(&self) -> Vec<Key> {
        let mut staleness = HashMap::new();
        let mut stale = Vec::new();
        let mut seen = HashSet::new();
        for ((key, _), handle) in self.live.entries() {
            let is_stale = *staleness
                .entry((handle.module.blob_hash(), handle.newest_timestamp))
                .or_insert_with(|| handle.is_stale());
            if is_stale && seen.insert(key.clone()) {
                stale.push(key);
            }
        }
        for key in &stale {
            self.invalidate(key);
        }
        if !stale.is_empty() {
            log::info!("invalidated {} stale shaders", stale.len());
        }
        stale
    }

    /// Forgets every handle and module of a context, returning how many modules were
    /// released.
    ///
    /// Requests for the context should have stopped before releasing it.
    #[inline]
    pub fn release_context(&self, context: ContextId) -> usize {
        let handles = self.live.drain_where(|&(_, owner), _| owner == context).len();
        self.retired.lock().retain(|&(_, owner), _| owner != context);
        let modules = self.modules.release_context(context);
        log::debug!("released context {context}: {handles} handles, {modules} modules");
        modules
    }

    /// Drops every blob no module or handle refers to, returning how many.
    #[inline]
    pub fn purge_unused_blobs(&self) -> usize {
        self.blobs.purge_unused()
    }

    /// Sizes of the caches.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            blobs: self.blobs.len(),
            modules: self.modules.len(),
            live_handles: self.live.len(),
            compilations: self.compilations.load(Ordering::Relaxed),
        }
    }
}
