//! Subcommands of the CLI.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use shader_cache::{
    backend::Diagnostic,
    blob::{content_hash, Blob},
    config::CacheConfig,
    key::Defines,
    module::{ContextId, ShaderContext},
    naga::NagaBackend,
    preprocess::{FsIncludeResolver, Preprocessor},
    Key, ShaderLoader, Stage,
};

use crate::user_output;

/// All of the available subcommands.
#[derive(clap::Subcommand)]
#[non_exhaustive]
pub enum Command {
    /// Expand includes and definitions, printing the resulting source.
    Preprocess(Preprocess),

    /// Compile a shader to SPIR-V and print its reflection.
    Compile(Compile),

    /// Print the options digest and content hash of a shader variant.
    Hash(Shader),
}

impl Command {
    /// Options of the command that can also come from a config file.
    pub const fn config(&self) -> &CacheConfig {
        match self {
            Self::Preprocess(preprocess) => &preprocess.shader.config,
            Self::Compile(compile) => &compile.shader.config,
            Self::Hash(shader) => &shader.config,
        }
    }

    /// Runs the command with the resolved config.
    pub fn run(&self, config: &CacheConfig) -> anyhow::Result<()> {
        match self {
            Self::Preprocess(preprocess) => preprocess.run(config),
            Self::Compile(compile) => compile.run(config),
            Self::Hash(shader) => hash(shader, config),
        }
    }
}

/// Arguments selecting a shader variant.
#[derive(clap::Args)]
#[non_exhaustive]
pub struct Shader {
    /// Root source file.
    pub file: PathBuf,

    /// Pipeline stage, guessed from the file extension if not given.
    #[clap(long)]
    pub stage: Option<Stage>,

    /// Entry point name.
    #[clap(long, default_value = "main")]
    pub entry: String,

    /// Preprocessor definition, `NAME` or `NAME=VALUE`.
    #[clap(short = 'D', long = "define")]
    pub defines: Vec<String>,

    /// Cache options.
    #[clap(flatten)]
    pub config: CacheConfig,
}

impl Shader {
    /// Stage to compile for.
    fn stage(&self) -> anyhow::Result<Stage> {
        self.stage
            .or_else(|| Stage::from_path(&self.file))
            .with_context(|| {
                format!(
                    "cannot tell the stage of {} from its extension, pass `--stage`",
                    self.file.display()
                )
            })
    }

    /// Key of the selected variant.
    fn key(&self) -> anyhow::Result<Key> {
        Key::canonical(&self.file, self.stage()?, self.entry.as_str(), &self.defines)
            .with_context(|| format!("reading {}", self.file.display()))
    }
}

/// Creates a preprocessor searching the configured include roots.
fn preprocessor(config: &CacheConfig) -> Preprocessor {
    Preprocessor::new(
        Arc::new(FsIncludeResolver::new(config.include_roots.clone())),
        config.max_include_depth,
    )
}

/// `preprocess` subcommand.
#[derive(clap::Args)]
#[non_exhaustive]
pub struct Preprocess {
    /// Variant to preprocess.
    #[clap(flatten)]
    pub shader: Shader,
}

impl Preprocess {
    /// Prints the expanded source followed by the files it was read from, as
    /// comments so the output stays valid GLSL.
    fn run(&self, config: &CacheConfig) -> anyhow::Result<()> {
        let defines = Defines::new(&self.shader.defines);
        let expanded = preprocessor(config).run(&self.shader.file, &defines)?;
        user_output!("{}", expanded.text)?;
        for dependency in &expanded.dependencies {
            user_output!("// depends on {}\n", dependency.display())?;
        }
        Ok(())
    }
}

/// `compile` subcommand.
#[derive(clap::Args)]
#[non_exhaustive]
pub struct Compile {
    /// Variant to compile.
    #[clap(flatten)]
    pub shader: Shader,

    /// Where to write the SPIR-V module.
    #[clap(short, long)]
    pub output: Option<PathBuf>,
}

impl Compile {
    /// Compiles through a loader, so the disk cache is used when enabled.
    fn run(&self, config: &CacheConfig) -> anyhow::Result<()> {
        let loader = ShaderLoader::<NagaBackend, ()>::with_config(NagaBackend::new(), config)?;
        let key = self.shader.key()?;
        let handle = loader.get(&key, &OfflineContext)?;
        let blob = handle.blob();
        log::info!(
            "compiled {key} to {} words, {} compilations",
            blob.spirv().len(),
            loader.stats().compilations
        );

        if let Some(output) = &self.output {
            write_spirv(output, blob)?;
            user_output!("wrote {}\n", output.display())?;
        }
        let reflection = serde_json::to_string_pretty(blob.reflection())?;
        user_output!("{reflection}\n")?;
        Ok(())
    }
}

/// Writes the module of `blob` to `path`.
fn write_spirv(path: &Path, blob: &Blob) -> anyhow::Result<()> {
    fs::write(path, blob.spirv_bytes()).with_context(|| format!("writing {}", path.display()))
}

/// Prints the digests identifying a variant.
fn hash(shader: &Shader, config: &CacheConfig) -> anyhow::Result<()> {
    let key = shader.key()?;
    let defines = key.defines().cloned().unwrap_or_default();
    let expanded = preprocessor(config).run(key.path(), &defines)?;
    user_output!(
        "options digest: {:016x}\ncontent hash:   {:016x}\n",
        key.options_digest(),
        content_hash(&expanded.text, &key)
    )?;
    Ok(())
}

/// Context of an offline compilation, where there is no device to create modules on.
struct OfflineContext;

impl ShaderContext for OfflineContext {
    type Resource = ();

    fn id(&self) -> ContextId {
        ContextId(0)
    }

    fn create_module(&self, _blob: &Blob) -> Result<(), Diagnostic> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use clap::Parser as _;

    use super::*;
    use crate::Cli;

    fn parse(args: &[&str]) -> Command {
        Cli::parse_from(["shader-cache"].iter().chain(args)).command
    }

    #[test_log::test]
    fn stage_is_guessed_from_extension() {
        let Command::Hash(shader) = parse(&["hash", "lit.frag", "-D", "FOG"]) else {
            panic!("expected hash");
        };
        assert_eq!(shader.stage().unwrap(), Stage::Fragment);
        assert_eq!(shader.entry, "main");
        assert_eq!(shader.defines, ["FOG"]);
    }

    #[test_log::test]
    fn explicit_stage_wins() {
        let Command::Compile(compile) =
            parse(&["compile", "blur.glsl", "--stage", "compute", "-o", "blur.spv"])
        else {
            panic!("expected compile");
        };
        assert_eq!(compile.shader.stage().unwrap(), Stage::Compute);
        assert_eq!(compile.output, Some(PathBuf::from("blur.spv")));
    }

    #[test_log::test]
    fn unknown_extension_needs_a_stage() {
        let Command::Hash(shader) = parse(&["hash", "shader.glsl"]) else {
            panic!("expected hash");
        };
        assert!(shader.stage().is_err());
    }

    #[test_log::test]
    fn compile_writes_spirv() {
        let dir = shader_cache_test_utils::ShaderDir::new();
        let source = dir
            .write(
                "tint.frag",
                "#version 450\nlayout(location = 0) out vec4 color;\nvoid main() { color = vec4(TINT); }\n",
            )
            .unwrap();
        let output = dir.path().join("tint.spv");
        let Command::Compile(compile) = parse(&[
            "compile",
            source.to_str().unwrap(),
            "-D",
            "TINT=0.5",
            "-o",
            output.to_str().unwrap(),
        ]) else {
            panic!("expected compile");
        };
        compile.run(&compile.shader.config).unwrap();
        let bytes = fs::read(&output).unwrap();
        assert_eq!(bytes.get(..4), Some(&[0x03, 0x02, 0x23, 0x07][..]));
    }

    #[test_log::test]
    fn preprocess_searches_include_roots() {
        let dir = shader_cache_test_utils::ShaderDir::new();
        dir.write("common/fog.glsl", "float fog() { return 1.0; }\n")
            .unwrap();
        let source = dir
            .write("lit.frag", "#include \"fog.glsl\"\nvoid main() {}\n")
            .unwrap();
        let roots = dir.path().join("common");
        let Command::Preprocess(preprocess) = parse(&[
            "preprocess",
            source.to_str().unwrap(),
            "-I",
            roots.to_str().unwrap(),
        ]) else {
            panic!("expected preprocess");
        };
        preprocess.run(&preprocess.shader.config).unwrap();

        let Command::Preprocess(missing) = parse(&["preprocess", source.to_str().unwrap()]) else {
            panic!("expected preprocess");
        };
        assert!(missing.run(&missing.shader.config).is_err());
    }

    #[test_log::test]
    fn hash_depends_on_defines() {
        let dir = shader_cache_test_utils::ShaderDir::new();
        let source = dir
            .write("blur.comp", "#version 450\nvoid main() {}\n")
            .unwrap();
        let path = source.to_str().unwrap();
        let plain = parse(&["hash", path]);
        let defined = parse(&["hash", path, "-D", "WIDE"]);
        let (Command::Hash(plain), Command::Hash(defined)) = (plain, defined) else {
            panic!("expected hash");
        };
        assert_ne!(
            plain.key().unwrap().options_digest(),
            defined.key().unwrap().options_digest()
        );
        hash(&plain, &plain.config).unwrap();
    }
}
