//! Identity of a requested shader variant.

use core::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    str::FromStr,
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::hash::fnv1a64;

/// Pipeline stage a shader is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
#[expect(clippy::exhaustive_enums, reason = "the set of pipeline stages is fixed")]
pub enum Stage {
    /// Vertex shader.
    Vertex,
    /// Fragment (pixel) shader.
    Fragment,
    /// Compute shader.
    Compute,
    /// Geometry shader.
    Geometry,
    /// Tessellation control (hull) shader.
    TessControl,
    /// Tessellation evaluation (domain) shader.
    TessEval,
}

impl Stage {
    /// Every stage, in ordinal order.
    pub const ALL: [Self; 6] = [
        Self::Vertex,
        Self::Fragment,
        Self::Compute,
        Self::Geometry,
        Self::TessControl,
        Self::TessEval,
    ];

    /// Stable ordinal of the stage, used when hashing and comparing keys.
    #[inline]
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Vertex => 0,
            Self::Fragment => 1,
            Self::Compute => 2,
            Self::Geometry => 3,
            Self::TessControl => 4,
            Self::TessEval => 5,
        }
    }

    /// Lowercase name of the stage.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
            Self::Geometry => "geometry",
            Self::TessControl => "tess-control",
            Self::TessEval => "tess-eval",
        }
    }

    /// Conventional GLSL file extension of the stage.
    #[inline]
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
            Self::Compute => "comp",
            Self::Geometry => "geom",
            Self::TessControl => "tesc",
            Self::TessEval => "tese",
        }
    }

    /// Guesses the stage from a conventional file extension like `frag`.
    #[inline]
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.extension().eq_ignore_ascii_case(extension))
    }

    /// Guesses the stage from the extension of the given path.
    #[inline]
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(Self::from_extension)
    }
}

impl Display for Stage {
    #[expect(
        clippy::min_ident_chars,
        reason = "It's a core library trait implementation"
    )]
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = UnknownStageError;

    #[inline]
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.name() == text || stage.extension() == text)
            .ok_or_else(|| UnknownStageError(text.to_owned()))
    }
}

/// An error indicating that a string names no known [`Stage`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown shader stage `{0}`")]
pub struct UnknownStageError(String);

/// A single preprocessor definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Define<'def> {
    /// Name of the macro.
    pub name: &'def str,
    /// Replacement text, [`None`] for a bare flag.
    pub value: Option<&'def str>,
}

impl<'def> Define<'def> {
    /// Splits `NAME` or `NAME=VALUE` at the first `=`.
    #[inline]
    #[must_use]
    pub fn parse(raw: &'def str) -> Self {
        match raw.split_once('=') {
            Some((name, value)) => Self {
                name: name.trim(),
                value: Some(value.trim()).filter(|value| !value.is_empty()),
            },
            None => Self {
                name: raw.trim(),
                value: None,
            },
        }
    }
}

/// Sorted, de-duplicated set of preprocessor definitions.
///
/// Each definition is kept in its raw `NAME` or `NAME=VALUE` form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Defines(Arc<[String]>);

impl Defines {
    /// Separator placed after every definition before hashing.
    ///
    /// A definition must not contain it, loaders reject keys whose definitions do.
    pub const SEPARATOR: char = '\n';

    /// Creates a set from definitions in any order, dropping duplicates.
    #[inline]
    #[must_use]
    pub fn new<I, S>(defines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut defines = defines.into_iter().map(Into::into).collect::<Vec<_>>();
        defines.sort_unstable();
        defines.dedup();
        Self(defines.into())
    }

    /// Order-independent digest of the set.
    ///
    /// Definitions are sorted lexicographically, each followed by [`Self::SEPARATOR`],
    /// and the joined bytes are hashed with 64-bit FNV-1a.
    #[inline]
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut joined = String::with_capacity(self.0.iter().map(|raw| raw.len() + 1).sum());
        for raw in self.0.iter() {
            joined.push_str(raw);
            joined.push(Self::SEPARATOR);
        }
        fnv1a64(joined.as_bytes())
    }

    /// Iterates over the raw definitions in sorted order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Iterates over the parsed definitions in sorted order.
    #[inline]
    pub fn parsed(&self) -> impl Iterator<Item = Define<'_>> {
        self.iter().map(Define::parse)
    }

    /// Number of distinct definitions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no definitions.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Defines {
    #[inline]
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Identity of a requested shader variant.
///
/// Two keys are equal iff their path, stage, entry point and options digest are equal.
/// A key built from definitions also carries them, so that a cache miss can be
/// preprocessed, but they never take part in comparisons.
#[derive(Debug, Clone)]
pub struct Key {
    /// Canonical path of the root source file.
    path: PathBuf,
    /// Pipeline stage.
    stage: Stage,
    /// Entry point name.
    entry: String,
    /// Digest of the definitions.
    options_digest: u64,
    /// Definitions the digest was computed from, when known.
    defines: Option<Defines>,
}

impl Key {
    /// Creates a key from a literal or dynamically built list of definitions.
    #[inline]
    #[must_use]
    pub fn new<P, E, I, S>(path: P, stage: Stage, entry: E, defines: I) -> Self
    where
        P: Into<PathBuf>,
        E: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_defines(path, stage, entry, Defines::new(defines))
    }

    /// Creates a key from a list of definitions built at runtime.
    #[inline]
    #[must_use]
    pub fn from_defines<P, E>(path: P, stage: Stage, entry: E, defines: Vec<String>) -> Self
    where
        P: Into<PathBuf>,
        E: Into<String>,
    {
        Self::with_defines(path, stage, entry, Defines::new(defines))
    }

    /// Creates a key from an already collected set of definitions.
    #[inline]
    #[must_use]
    pub fn with_defines<P, E>(path: P, stage: Stage, entry: E, defines: Defines) -> Self
    where
        P: Into<PathBuf>,
        E: Into<String>,
    {
        Self {
            path: path.into(),
            stage,
            entry: entry.into(),
            options_digest: defines.digest(),
            defines: Some(defines),
        }
    }

    /// Creates a key from a precomputed options digest.
    ///
    /// Such a key can only be compiled if the loader has seen its definitions before.
    #[inline]
    #[must_use]
    pub fn with_digest<P, E>(path: P, stage: Stage, entry: E, options_digest: u64) -> Self
    where
        P: Into<PathBuf>,
        E: Into<String>,
    {
        Self {
            path: path.into(),
            stage,
            entry: entry.into(),
            options_digest,
            defines: None,
        }
    }

    /// Like [`Key::new`], but canonicalizes the path first.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or cannot be resolved.
    #[inline]
    pub fn canonical<P, E, I, S>(path: P, stage: Stage, entry: E, defines: I) -> io::Result<Self>
    where
        P: AsRef<Path>,
        E: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = dunce::canonicalize(path)?;
        Ok(Self::new(path, stage, entry, defines))
    }

    /// Path of the root source file.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pipeline stage.
    #[inline]
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Entry point name.
    #[inline]
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Digest of the definitions.
    #[inline]
    #[must_use]
    pub const fn options_digest(&self) -> u64 {
        self.options_digest
    }

    /// Definitions the key was built from, if it was not built from a digest.
    #[inline]
    #[must_use]
    pub const fn defines(&self) -> Option<&Defines> {
        self.defines.as_ref()
    }
}

impl PartialEq for Key {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.stage.ordinal() == other.stage.ordinal()
            && self.entry == other.entry
            && self.options_digest == other.options_digest
    }
}

impl Eq for Key {}

impl Hash for Key {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.stage.ordinal().hash(state);
        self.entry.hash(state);
        self.options_digest.hash(state);
    }
}

impl Display for Key {
    #[expect(
        clippy::min_ident_chars,
        reason = "It's a core library trait implementation"
    )]
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}#{:016x}",
            self.path.display(),
            self.stage,
            self.entry,
            self.options_digest
        )
    }
}
