//! Blobs realized inside execution contexts.
//!
//! An execution context (a device, a driver session) turns a [`Blob`] into a
//! context-resident object. The [`ModuleCache`] creates that object at most once per
//! blob and context, and forgets everything of a context on request.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::{Mutex, RwLock};

use crate::{backend::Diagnostic, blob::Blob, error::Error, flight::FlightMap};

/// Opaque identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[expect(clippy::exhaustive_structs, reason = "plain identifier")]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    #[expect(
        clippy::min_ident_chars,
        reason = "It's a core library trait implementation"
    )]
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An execution context shader modules are created in.
pub trait ShaderContext: Send + Sync {
    /// Context-resident object created from a blob.
    ///
    /// Dropping it must release whatever the context allocated for it.
    type Resource: Send + Sync;

    /// Identity of the context.
    fn id(&self) -> ContextId;

    /// Creates the context-resident object of a blob.
    ///
    /// # Errors
    ///
    /// Returns the diagnostic of the context if it rejects the blob.
    fn create_module(&self, blob: &Blob) -> Result<Self::Resource, Diagnostic>;
}

/// A blob realized inside one context.
#[derive(Debug)]
pub struct Module<R> {
    /// The realized blob.
    blob: Arc<Blob>,
    /// Context owning the resource.
    context: ContextId,
    /// The context-resident object.
    resource: R,
}

impl<R> Module<R> {
    /// The realized blob.
    #[inline]
    #[must_use]
    pub const fn blob(&self) -> &Arc<Blob> {
        &self.blob
    }

    /// Content hash of the realized blob.
    #[inline]
    #[must_use]
    pub fn blob_hash(&self) -> u64 {
        self.blob.content_hash()
    }

    /// Context owning the resource.
    #[inline]
    #[must_use]
    pub const fn context(&self) -> ContextId {
        self.context
    }

    /// The context-resident object.
    #[inline]
    #[must_use]
    pub const fn resource(&self) -> &R {
        &self.resource
    }
}

/// Cache of modules, at most one per blob and context.
pub struct ModuleCache<R> {
    /// Modules by blob hash and context.
    modules: FlightMap<(u64, ContextId), Arc<Module<R>>>,
    /// Per-context gates, held shared while creating and exclusively while releasing.
    gates: Mutex<HashMap<ContextId, Arc<RwLock<()>>>>,
}

impl<R> Default for ModuleCache<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> ModuleCache<R> {
    /// Creates an empty cache.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: FlightMap::new(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the gate of a context.
    fn gate(&self, context: ContextId) -> Arc<RwLock<()>> {
        Arc::clone(self.gates.lock().entry(context).or_default())
    }

    /// Returns the module of the blob in the context, creating it on a miss.
    ///
    /// Concurrent calls for the same blob and context create it once. A failed
    /// creation caches nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContextResource`] if the context rejects the blob.
    #[inline]
    pub fn lookup_or_create<C>(&self, blob: &Arc<Blob>, context: &C) -> Result<Arc<Module<R>>, Error>
    where
        C: ShaderContext<Resource = R> + ?Sized,
    {
        let id = context.id();
        let blob_hash = blob.content_hash();
        if let Some(module) = self.modules.get(&(blob_hash, id)) {
            return Ok(module);
        }

        let gate = self.gate(id);
        let _creating = gate.read();
        self.modules.get_or_try_insert_with(&(blob_hash, id), || {
            log::debug!("creating module of {blob_hash:016x} in context {id}");
            let resource =
                context
                    .create_module(blob)
                    .map_err(|diagnostic| Error::ContextResource {
                        context: id,
                        blob_hash,
                        diagnostic: diagnostic.0,
                    })?;
            Ok(Arc::new(Module {
                blob: Arc::clone(blob),
                context: id,
                resource,
            }))
        })
    }

    /// Returns the cached module of the blob in the context.
    #[inline]
    #[must_use]
    pub fn get(&self, blob_hash: u64, context: ContextId) -> Option<Arc<Module<R>>> {
        self.modules.get(&(blob_hash, context))
    }

    /// Forgets every module of a context, returning how many.
    ///
    /// Waits for creations in that context to finish first. Modules still referenced
    /// elsewhere stay alive until their last reference drops.
    #[inline]
    pub fn release_context(&self, context: ContextId) -> usize {
        let gate = self.gate(context);
        let released = {
            let _releasing = gate.write();
            self.modules
                .drain_where(|&(_, owner), _| owner == context)
                .len()
        };
        let mut gates = self.gates.lock();
        // keep the gate if a creation in the context picked it up meanwhile
        if gates
            .get(&context)
            .is_some_and(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) == 2)
        {
            gates.remove(&context);
        }
        drop(gates);
        log::debug!("released {released} modules of context {context}");
        released
    }

    /// Number of cached modules.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if nothing is cached.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
