//! Mock compiler and execution contexts shared by the integration tests.

#![allow(dead_code, reason = "not every test uses every mock")]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use shader_cache::{
    backend::{CompilerBackend, Diagnostic, ReflectionInfo},
    blob::Blob,
    disk::SPIRV_MAGIC,
    hash::fnv1a64,
    module::{ContextId, ShaderContext},
    Stage,
};

/// Backend that counts its compilations and derives the words from the source.
///
/// Sources containing `#error` fail to compile.
#[derive(Default)]
pub struct CountingBackend {
    pub compilations: AtomicUsize,
    pub delay: Option<Duration>,
}

impl CountingBackend {
    pub fn slow(delay: Duration) -> Self {
        Self {
            compilations: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn count(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

impl CompilerBackend for CountingBackend {
    fn identity(&self) -> &str {
        "counting-backend 1.0"
    }

    fn compile(&self, source: &str, stage: Stage, entry: &str) -> Result<Vec<u32>, Diagnostic> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(line) = source.lines().find(|line| line.contains("#error")) {
            return Err(Diagnostic::new(format!("0:1: {line}")));
        }
        let digest = fnv1a64(format!("{stage}:{entry}:{source}").as_bytes());
        Ok(vec![SPIRV_MAGIC, digest as u32, (digest >> 32) as u32])
    }

    fn reflect(&self, _spirv: &[u32]) -> Result<ReflectionInfo, Diagnostic> {
        Ok(ReflectionInfo::default())
    }
}

/// Resource handed out by [`TestContext`], counting the live ones.
pub struct TestResource {
    pub blob_hash: u64,
    live: Arc<AtomicUsize>,
}

impl Drop for TestResource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Execution context counting module creations.
pub struct TestContext {
    pub id: u64,
    pub created: AtomicUsize,
    pub live: Arc<AtomicUsize>,
    pub reject: AtomicBool,
    pub delay: Option<Duration>,
}

impl TestContext {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            created: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            reject: AtomicBool::new(false),
            delay: None,
        }
    }

    /// Context that takes `delay` to create each module.
    pub fn slow(id: u64, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(id)
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl ShaderContext for TestContext {
    type Resource = TestResource;

    fn id(&self) -> ContextId {
        ContextId(self.id)
    }

    fn create_module(&self, blob: &Blob) -> Result<TestResource, Diagnostic> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(Diagnostic::new("device lost"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(TestResource {
            blob_hash: blob.content_hash(),
            live: Arc::clone(&self.live),
        })
    }
}
