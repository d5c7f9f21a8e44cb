//! Command line tool for preprocessing and compiling GLSL through `shader-cache`.
//!
//! ```text
//! shader-cache preprocess shaders/lit.frag -D MAX_LIGHTS=4 -I shaders/common
//! shader-cache compile shaders/lit.frag -D MAX_LIGHTS=4 -o lit.spv
//! shader-cache hash shaders/lit.frag -D MAX_LIGHTS=4
//! ```
//!
//! Options not given on the command line are read from the file passed with
//! `--config`, or from `./shader-cache.toml` if it exists.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser as _;
use shader_cache::config::CacheConfig;

mod command;
mod merge;

use self::command::Command;

/// Config file picked up from the working directory.
const DEFAULT_CONFIG_FILE: &str = "shader-cache.toml";

/// Central function to write to the user.
#[macro_export]
macro_rules! user_output {
    ($($args: tt)*) => { {
        use std::io::Write as _;
        let mut stdout = std::io::stdout().lock();
        write!(stdout, $($args)*).and_then(|()| stdout.flush())
    } }
}

/// The struct representing the main CLI.
#[derive(clap::Parser)]
#[clap(author, version, about, subcommand_required = true)]
struct Cli {
    /// Log more, repeat for even more.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file to read options from.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// The command to run.
    #[clap(subcommand)]
    command: Command,
}

impl Cli {
    /// Config file to use, if any.
    fn config_file(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            let local = Path::new(DEFAULT_CONFIG_FILE);
            local.is_file().then(|| local.to_path_buf())
        })
    }

    /// Reads the config file and overlays the options given on the command line.
    fn resolve_config(&self) -> anyhow::Result<CacheConfig> {
        let from_file = match self.config_file() {
            Some(path) => {
                log::debug!("reading config from {}", path.display());
                CacheConfig::from_toml_file(&path)?
            }
            None => CacheConfig::default(),
        };
        merge::merge(&from_file, self.command.config()).context("merging config with flags")
    }
}

/// Installs the logger, `warn` by default and louder per `-v`.
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = cli.resolve_config()?;
    cli.command.run(&config)
}
