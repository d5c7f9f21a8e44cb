//! Content-addressed cache of compiled shader variants.
//!
//! Given a source file, a pipeline [stage](key::Stage), an entry point and a set of
//! preprocessor definitions (together a [`Key`](key::Key)), this library produces a
//! ready-to-use compiled shader while avoiding redundant preprocessing, compilation
//! and creation of context-resident objects.
//!
//! # How it works
//!
//! A request flows through four layers, each one a cache of the next:
//!
//! * the live handle registry of the [`ShaderLoader`](loader::ShaderLoader) returns
//!   the [`Handle`](loader::Handle) given out last time for the same key and context,
//! * on a miss, the [preprocessor](preprocess) expands includes and prepends the macro
//!   preamble, recording every file it opened,
//! * the preprocessed text is hashed into a content hash, which addresses a
//!   context-independent [`Blob`](blob::Blob) in the [blob cache](blob::BlobCache);
//!   only a miss there invokes the [compiler backend](backend::CompilerBackend),
//! * the [module cache](module::ModuleCache) realizes the blob inside each
//!   [execution context](module::ShaderContext) at most once.
//!
//! All caches may be shared between threads. Concurrent requests that resolve to the
//! same content hash wait for the first requester instead of compiling again.

pub mod backend;
pub mod blob;
pub mod config;
pub mod disk;
pub mod error;
pub mod hash;
pub mod key;
pub mod loader;
pub mod module;
#[cfg(feature = "naga")]
pub mod naga;
pub mod preprocess;

mod flight;

#[expect(clippy::pub_use, reason = "part of public API")]
pub use self::{
    error::Error,
    key::{Key, Stage},
    loader::{Handle, ShaderLoader},
};
