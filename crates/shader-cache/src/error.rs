//! Failures of a shader request.
//!
//! Every error is terminal for the request that triggered it and leaves the caches
//! untouched. Errors are [`Clone`], since a failed in-flight computation hands the same
//! error to everyone who waited on it.

use std::{io, path::PathBuf, sync::Arc};

use crate::{key::Stage, module::ContextId};

/// An error indicating that a shader could not be produced.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A source file could not be read.
    #[error("failed to read shader source {path}: {source}")]
    SourceNotFound {
        /// Path of the file.
        path: PathBuf,
        /// Source of the error.
        source: Arc<io::Error>,
    },
    /// No candidate file exists for an include directive.
    #[error("could not resolve include \"{header}\" requested by {includer}")]
    IncludeNotResolved {
        /// Header name as written in the directive.
        header: String,
        /// File containing the directive.
        includer: PathBuf,
    },
    /// Include or macro expansion failed structurally.
    #[error("failed to preprocess {path}: {diagnostic}")]
    Preprocess {
        /// File being expanded when the failure occurred.
        path: PathBuf,
        /// What went wrong.
        diagnostic: String,
    },
    /// The compiler backend rejected the preprocessed source.
    #[error("failed to compile `{entry}` of {path} as {stage} shader:\n{diagnostic}")]
    Compile {
        /// Root source file.
        path: PathBuf,
        /// Requested stage.
        stage: Stage,
        /// Requested entry point.
        entry: String,
        /// Diagnostic text of the backend.
        diagnostic: String,
    },
    /// The compiler backend could not reflect a compiled artifact.
    #[error("failed to reflect shader {content_hash:016x}: {diagnostic}")]
    Reflection {
        /// Content hash of the artifact.
        content_hash: u64,
        /// Diagnostic text of the backend.
        diagnostic: String,
    },
    /// An execution context rejected a compiled artifact.
    ///
    /// This is the one failure worth retrying, e.g. after recreating the context.
    #[error("context {context} rejected shader {blob_hash:016x}: {diagnostic}")]
    ContextResource {
        /// The rejecting context.
        context: ContextId,
        /// Content hash of the rejected artifact.
        blob_hash: u64,
        /// Diagnostic text of the context.
        diagnostic: String,
    },
    /// A key built from a bare digest missed every cache, and no definitions were
    /// ever seen for that digest.
    #[error("no definitions known for options digest {digest:016x}")]
    UnknownOptions {
        /// The unknown digest.
        digest: u64,
    },
}

impl Error {
    /// Creates [`SourceNotFound`](Error::SourceNotFound) from given arguments.
    pub(crate) fn source_not_found(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::SourceNotFound {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Creates [`Preprocess`](Error::Preprocess) from given arguments.
    pub(crate) fn preprocess(path: impl Into<PathBuf>, diagnostic: impl Into<String>) -> Self {
        Self::Preprocess {
            path: path.into(),
            diagnostic: diagnostic.into(),
        }
    }
}
