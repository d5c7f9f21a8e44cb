//! Include expansion and macro preamble.
//!
//! Preprocessing turns a root source file and a set of [`Defines`] into one
//! self-contained text, and records every file it opened along the way. Only
//! `#include` and `#pragma once` are interpreted here, every other line reaches the
//! compiler untouched. The text produced is what the content hash is computed over,
//! so it must only depend on the files read and the definitions given.
//!
//! The output looks like
//!
//! ```glsl
//! #version 450          // hoisted, if the root starts with it
//! #define MAX_LIGHTS 4  // one line per definition, sorted
//! #line 1
//! ...root source, with every include replaced by the included text...
//! ```

use std::{
    collections::HashSet,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use crate::{
    error::Error,
    key::{Define, Defines},
};

/// Finds the files named by include directives.
pub trait IncludeResolver: Send + Sync {
    /// Resolves `header` as written in a directive of `includer`.
    ///
    /// Returns [`None`] if no candidate file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a candidate exists but cannot be read.
    fn resolve(&self, header: &str, includer: &Path) -> Result<Option<ResolvedInclude>, Error>;
}

/// Contents of a resolved include.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResolvedInclude {
    /// Canonical absolute path of the file.
    pub path: PathBuf,
    /// Text of the file.
    pub contents: String,
    /// Modification time of the file, taken before its contents were read.
    pub modified: Option<SystemTime>,
}

impl ResolvedInclude {
    /// Creates a resolved include without a modification time.
    #[inline]
    #[must_use]
    pub const fn new(path: PathBuf, contents: String) -> Self {
        Self {
            path,
            contents,
            modified: None,
        }
    }

    /// Sets the modification time, which must be taken before reading the contents.
    #[inline]
    #[must_use]
    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }
}

/// Modification time of a file, [`None`] if it cannot be read.
pub(crate) fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
}

/// Resolves includes on the file system.
///
/// A header is looked up relative to the directory of the including file first,
/// then relative to each include root in order.
#[derive(Debug, Clone, Default)]
pub struct FsIncludeResolver {
    /// Include roots, in search order.
    roots: Vec<PathBuf>,
}

impl FsIncludeResolver {
    /// Creates a resolver searching the given include roots.
    #[inline]
    #[must_use]
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().collect(),
        }
    }
}

impl IncludeResolver for FsIncludeResolver {
    #[inline]
    fn resolve(&self, header: &str, includer: &Path) -> Result<Option<ResolvedInclude>, Error> {
        let relative = includer.parent().map(|dir| dir.join(header));
        let candidates = relative
            .into_iter()
            .chain(self.roots.iter().map(|root| root.join(header)));
        for candidate in candidates {
            if !candidate.is_file() {
                log::trace!("include candidate {} does not exist", candidate.display());
                continue;
            }
            let path = dunce::canonicalize(&candidate)
                .map_err(|err| Error::source_not_found(&candidate, err))?;
            let read_at = modified(&path);
            let contents =
                fs::read_to_string(&path).map_err(|err| Error::source_not_found(&path, err))?;
            return Ok(Some(ResolvedInclude::new(path, contents).with_modified(read_at)));
        }
        Ok(None)
    }
}

/// Result of preprocessing a root file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PreprocessedSource {
    /// Fully expanded text, preamble included.
    pub text: String,
    /// Canonical path of every file read, root first, in order of first opening.
    pub dependencies: Vec<PathBuf>,
    /// Newest modification time among the files, each taken before reading it.
    pub newest_timestamp: Option<SystemTime>,
}

/// Expands includes and prepends the macro preamble.
#[derive(Clone)]
pub struct Preprocessor {
    /// Resolver of include directives.
    resolver: Arc<dyn IncludeResolver>,
    /// Maximum nesting of includes.
    max_include_depth: usize,
}

impl Preprocessor {
    /// Creates a preprocessor.
    #[inline]
    #[must_use]
    pub fn new(resolver: Arc<dyn IncludeResolver>, max_include_depth: usize) -> Self {
        Self {
            resolver,
            max_include_depth,
        }
    }

    /// Maximum nesting of includes.
    #[inline]
    #[must_use]
    pub const fn max_include_depth(&self) -> usize {
        self.max_include_depth
    }

    /// Preprocesses the root file with the given definitions.
    ///
    /// # Errors
    ///
    /// * [`Error::SourceNotFound`] if the root or an include cannot be read,
    /// * [`Error::IncludeNotResolved`] if an include has no candidate file,
    /// * [`Error::Preprocess`] on an include cycle, includes nested deeper than the
    ///   limit, a malformed include directive or an invalid macro name.
    #[inline]
    pub fn run(&self, root: &Path, defines: &Defines) -> Result<PreprocessedSource, Error> {
        let path = dunce::canonicalize(root).map_err(|err| Error::source_not_found(root, err))?;
        let read_at = modified(&path);
        let source =
            fs::read_to_string(&path).map_err(|err| Error::source_not_found(&path, err))?;
        log::debug!(
            "preprocessing {} with {} definitions",
            path.display(),
            defines.len()
        );

        let mut expansion = Expansion {
            preprocessor: self,
            text: String::with_capacity(source.len()),
            dependencies: vec![path.clone()],
            opened: HashSet::from([path.clone()]),
            included_once: HashSet::new(),
            stack: Vec::new(),
            newest_timestamp: read_at,
        };
        let version = version_line(&source);
        expansion.preamble(&path, version.map(|(_, line)| line), defines)?;
        expansion.expand(&path, &source, version.map(|(index, _)| index))?;

        log::trace!(
            "preprocessed {} into {} bytes from {} files",
            path.display(),
            expansion.text.len(),
            expansion.dependencies.len()
        );
        Ok(PreprocessedSource {
            text: expansion.text,
            dependencies: expansion.dependencies,
            newest_timestamp: expansion.newest_timestamp,
        })
    }
}

/// State of a single preprocessing run.
struct Expansion<'pre> {
    /// Settings of the run.
    preprocessor: &'pre Preprocessor,
    /// Output so far.
    text: String,
    /// Files opened so far, in order.
    dependencies: Vec<PathBuf>,
    /// Same as `dependencies`, for lookups.
    opened: HashSet<PathBuf>,
    /// Files that carry `#pragma once` and were already expanded.
    included_once: HashSet<PathBuf>,
    /// Files currently being expanded, outermost first.
    stack: Vec<PathBuf>,
    /// Newest modification time seen so far.
    newest_timestamp: Option<SystemTime>,
}

impl Expansion<'_> {
    /// Emits the hoisted `#version` line, the definitions and a line reset.
    fn preamble(
        &mut self,
        root: &Path,
        version: Option<&str>,
        defines: &Defines,
    ) -> Result<(), Error> {
        if let Some(version) = version {
            self.text.push_str(version.trim());
            self.text.push('\n');
        }
        for define in defines.parsed() {
            validate_define(root, &define)?;
            let written = match define.value {
                Some(value) => writeln!(self.text, "#define {} {value}", define.name),
                None => writeln!(self.text, "#define {}", define.name),
            };
            written.map_err(|err| Error::preprocess(root, err.to_string()))?;
        }
        if version.is_some() || !defines.is_empty() {
            self.text.push_str("#line 1\n");
        }
        Ok(())
    }

    /// Appends the expanded text of a file, skipping the line at `skip` if given.
    fn expand(&mut self, path: &Path, source: &str, skip: Option<usize>) -> Result<(), Error> {
        self.stack.push(path.to_path_buf());
        for (index, line) in source.lines().enumerate() {
            if Some(index) == skip {
                self.text.push('\n');
                continue;
            }
            match Directive::parse(line) {
                Some(Directive::Include(header)) => {
                    let header = parse_header(header).ok_or_else(|| {
                        Error::preprocess(
                            path,
                            format!(
                                "malformed include directive on line {}: `{}`",
                                index + 1,
                                line.trim()
                            ),
                        )
                    })?;
                    self.include(path, header, index + 1)?;
                }
                Some(Directive::PragmaOnce) => {
                    self.included_once.insert(path.to_path_buf());
                    self.text.push('\n');
                }
                None => {
                    self.text.push_str(line);
                    self.text.push('\n');
                }
            }
        }
        self.stack.pop();
        Ok(())
    }

    /// Expands an include directive found on `line` of `includer`.
    fn include(&mut self, includer: &Path, header: &str, line: usize) -> Result<(), Error> {
        let resolved = self
            .preprocessor
            .resolver
            .resolve(header, includer)?
            .ok_or_else(|| Error::IncludeNotResolved {
                header: header.to_owned(),
                includer: includer.to_path_buf(),
            })?;
        if self.included_once.contains(&resolved.path) {
            log::trace!("skipping {} guarded by #pragma once", resolved.path.display());
            self.text.push('\n');
            return Ok(());
        }
        if self.stack.contains(&resolved.path) {
            let chain = self
                .stack
                .iter()
                .chain([&resolved.path])
                .map(|file| file.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(Error::preprocess(includer, format!("include cycle: {chain}")));
        }
        if self.stack.len() > self.preprocessor.max_include_depth {
            return Err(Error::preprocess(
                includer,
                format!(
                    "includes nested deeper than {} levels",
                    self.preprocessor.max_include_depth
                ),
            ));
        }
        if self.opened.insert(resolved.path.clone()) {
            self.dependencies.push(resolved.path.clone());
        }
        self.newest_timestamp = self.newest_timestamp.max(resolved.modified);

        self.text.push_str("#line 1\n");
        self.expand(&resolved.path, &resolved.contents, None)?;
        // resume numbering at the line after the directive
        writeln!(self.text, "#line {}", line + 1)
            .map_err(|err| Error::preprocess(includer, err.to_string()))
    }
}

/// A directive interpreted by the preprocessor.
#[derive(Debug, PartialEq, Eq)]
enum Directive<'line> {
    /// `#include` followed by the raw header operand.
    Include(&'line str),
    /// `#pragma once`.
    PragmaOnce,
}

impl<'line> Directive<'line> {
    /// Recognizes a directive line, tolerating whitespace around the `#`.
    fn parse(line: &'line str) -> Option<Self> {
        let rest = line.trim_start().strip_prefix('#')?.trim_start();
        if let Some(operand) = rest.strip_prefix("include") {
            let separated = operand.is_empty()
                || operand.starts_with(|ch: char| ch.is_whitespace() || ch == '"' || ch == '<');
            return separated.then(|| Self::Include(operand.trim()));
        }
        let operand = rest.strip_prefix("pragma")?;
        (operand.starts_with(char::is_whitespace) && operand.trim() == "once")
            .then_some(Self::PragmaOnce)
    }
}

/// Extracts the header name of `"name"` or `<name>`, allowing a trailing comment.
fn parse_header(operand: &str) -> Option<&str> {
    let close = match operand.chars().next()? {
        '"' => '"',
        '<' => '>',
        _ => return None,
    };
    let inner = operand.get(1..)?;
    let (header, rest) = inner.split_once(close)?;
    let rest = rest.trim();
    (!header.is_empty() && (rest.is_empty() || rest.starts_with("//"))).then_some(header)
}

/// Finds the `#version` line if it is the first line that is not blank or a line
/// comment, returning its index and text.
fn version_line(source: &str) -> Option<(usize, &str)> {
    let (index, line) = source.lines().enumerate().find(|(_, line)| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("//")
    })?;
    let directive = line.trim_start().strip_prefix('#')?.trim_start();
    directive.starts_with("version").then_some((index, line))
}

/// Checks that a definition can be emitted as a single `#define` line.
fn validate_define(root: &Path, define: &Define<'_>) -> Result<(), Error> {
    let mut chars = define.name.chars();
    let valid_name = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !valid_name {
        return Err(Error::preprocess(
            root,
            format!("invalid macro name `{}`", define.name),
        ));
    }
    if define.value.is_some_and(|value| value.contains(['\n', '\r'])) {
        return Err(Error::preprocess(
            root,
            format!("value of macro `{}` spans multiple lines", define.name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use shader_cache_test_utils::ShaderDir;

    use super::*;

    fn preprocessor(roots: Vec<PathBuf>) -> Preprocessor {
        Preprocessor::new(Arc::new(FsIncludeResolver::new(roots)), 32)
    }

    #[test_log::test]
    fn preamble_hoists_version_and_sorts_defines() {
        let dir = ShaderDir::new();
        let root = dir
            .write("lit.frag", "// lighting\n#version 450\nvoid main() {}\n")
            .unwrap();
        let out = preprocessor(Vec::new())
            .run(&root, &Defines::new(["USE_FOG", "MAX_LIGHTS=4"]))
            .unwrap();
        assert_eq!(
            out.text,
            "#version 450\n#define MAX_LIGHTS 4\n#define USE_FOG\n#line 1\n// lighting\n\nvoid main() {}\n"
        );
        assert_eq!(out.dependencies, [root]);
    }

    #[test_log::test]
    fn no_preamble_without_version_or_defines() {
        let dir = ShaderDir::new();
        let root = dir.write("plain.comp", "void main() {}\n").unwrap();
        let out = preprocessor(Vec::new()).run(&root, &Defines::default()).unwrap();
        assert_eq!(out.text, "void main() {}\n");
    }

    #[test_log::test]
    fn includes_are_expanded_with_line_markers() {
        let dir = ShaderDir::new();
        let common = dir.write("common.glsl", "float k = 1.0;\n").unwrap();
        let root = dir
            .write("a.frag", "#include \"common.glsl\"\nvoid main() {}\n")
            .unwrap();
        let out = preprocessor(Vec::new()).run(&root, &Defines::default()).unwrap();
        assert_eq!(out.text, "#line 1\nfloat k = 1.0;\n#line 2\nvoid main() {}\n");
        assert_eq!(out.dependencies, [root, common]);
    }

    #[test_log::test]
    fn newest_timestamp_covers_includes() {
        let dir = ShaderDir::new();
        let root = dir
            .write("a.frag", "#include \"common.glsl\"\nvoid main() {}\n")
            .unwrap();
        let common = dir.touch("common.glsl", "float k = 1.0;\n").unwrap();
        let out = preprocessor(Vec::new()).run(&root, &Defines::default()).unwrap();
        assert_eq!(out.newest_timestamp, modified(&common));
        assert!(out.newest_timestamp > modified(&root));
    }

    #[test_log::test]
    fn includer_directory_wins_over_roots() {
        let dir = ShaderDir::new();
        let local = dir.write("shaders/util.glsl", "// local\n").unwrap();
        dir.write("lib/util.glsl", "// library\n").unwrap();
        dir.write("lib/extra.glsl", "// extra\n").unwrap();
        let root = dir
            .write("shaders/a.vert", "#include \"util.glsl\"\n#include <extra.glsl>\n")
            .unwrap();
        let out = preprocessor(vec![dir.path().join("lib")])
            .run(&root, &Defines::default())
            .unwrap();
        assert!(out.text.contains("// local"));
        assert!(!out.text.contains("// library"));
        assert!(out.text.contains("// extra"));
        assert_eq!(out.dependencies.get(1), Some(&local));
    }

    #[test_log::test]
    fn dependencies_are_deduplicated_in_first_open_order() {
        let dir = ShaderDir::new();
        let a = dir.write("a.glsl", "// a\n").unwrap();
        let b = dir.write("b.glsl", "#include \"a.glsl\"\n").unwrap();
        let root = dir
            .write(
                "root.frag",
                "#include \"b.glsl\"\n#include \"a.glsl\"\n#include \"b.glsl\"\n",
            )
            .unwrap();
        let out = preprocessor(Vec::new()).run(&root, &Defines::default()).unwrap();
        assert_eq!(out.dependencies, [root, b, a]);
    }

    #[test_log::test]
    fn pragma_once_expands_a_file_once() {
        let dir = ShaderDir::new();
        dir.write("guarded.glsl", "#pragma once\nint guarded;\n").unwrap();
        let root = dir
            .write("root.frag", "#include \"guarded.glsl\"\n#include \"guarded.glsl\"\n")
            .unwrap();
        let out = preprocessor(Vec::new()).run(&root, &Defines::default()).unwrap();
        assert_eq!(out.text.matches("int guarded;").count(), 1);
    }

    #[test_log::test]
    fn include_cycle_is_reported_with_its_chain() {
        let dir = ShaderDir::new();
        dir.write("a.glsl", "#include \"b.glsl\"\n").unwrap();
        dir.write("b.glsl", "#include \"a.glsl\"\n").unwrap();
        let root = dir.write("root.frag", "#include \"a.glsl\"\n").unwrap();
        let err = preprocessor(Vec::new())
            .run(&root, &Defines::default())
            .unwrap_err();
        let Error::Preprocess { diagnostic, .. } = err else {
            panic!("expected a preprocess error, got {err:?}");
        };
        assert!(diagnostic.starts_with("include cycle:"), "{diagnostic}");
        assert!(diagnostic.contains("a.glsl -> "), "{diagnostic}");
    }

    #[test_log::test]
    fn depth_limit_is_enforced() {
        let dir = ShaderDir::new();
        for level in 0..4 {
            dir.write(
                format!("level{level}.glsl"),
                &format!("#include \"level{}.glsl\"\n", level + 1),
            )
            .unwrap();
        }
        dir.write("level4.glsl", "// bottom\n").unwrap();
        let root = dir.write("root.frag", "#include \"level0.glsl\"\n").unwrap();
        let shallow = Preprocessor::new(Arc::new(FsIncludeResolver::default()), 2);
        assert!(matches!(
            shallow.run(&root, &Defines::default()),
            Err(Error::Preprocess { .. })
        ));
        let deep = Preprocessor::new(Arc::new(FsIncludeResolver::default()), 5);
        assert!(deep.run(&root, &Defines::default()).is_ok());
    }

    #[test_log::test]
    fn unresolved_and_malformed_includes() {
        let dir = ShaderDir::new();
        let missing = dir.write("missing.frag", "#include \"nope.glsl\"\n").unwrap();
        let err = preprocessor(Vec::new())
            .run(&missing, &Defines::default())
            .unwrap_err();
        assert!(
            matches!(&err, Error::IncludeNotResolved { header, includer } if header == "nope.glsl" && *includer == missing),
            "{err:?}"
        );

        let malformed = dir.write("malformed.frag", "#include nope.glsl\n").unwrap();
        assert!(matches!(
            preprocessor(Vec::new()).run(&malformed, &Defines::default()),
            Err(Error::Preprocess { .. })
        ));
    }

    #[test_log::test]
    fn missing_root_is_source_not_found() {
        let dir = ShaderDir::new();
        let err = preprocessor(Vec::new())
            .run(&dir.path().join("absent.frag"), &Defines::default())
            .unwrap_err();
        assert!(matches!(err, Error::SourceNotFound { .. }));
    }

    #[test_log::test]
    fn invalid_macro_names_are_rejected() {
        let dir = ShaderDir::new();
        let root = dir.write("a.frag", "void main() {}\n").unwrap();
        for bad in ["1ST", "HAS SPACE", "", "DASH-ED=1"] {
            let result = preprocessor(Vec::new()).run(&root, &Defines::new([bad]));
            assert!(matches!(result, Err(Error::Preprocess { .. })), "{bad}");
        }
    }

    #[test_log::test]
    fn directive_recognition() {
        assert_eq!(Directive::parse("  #  include \"a\""), Some(Directive::Include("\"a\"")));
        assert_eq!(Directive::parse("#pragma once"), Some(Directive::PragmaOnce));
        assert_eq!(Directive::parse("#pragma optimize(on)"), None);
        assert_eq!(Directive::parse("#included"), None);
        assert_eq!(parse_header("<lib/x.glsl> // note"), Some("lib/x.glsl"));
        assert_eq!(parse_header("\"x.glsl\" trailing"), None);
        assert_eq!(parse_header("\"\""), None);
    }
}
