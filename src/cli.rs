use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a freshly inserted card for a platform
    Setup(SetupArgs),

    /// Validate a recipe file without touching any device
    Validate(ValidateArgs),

    /// Generate shell completions
    Completion(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Platform to provision (must match the recipe's declaration)
    pub platform: String,

    /// Path to the recipe file
    #[arg(short = 'f', long, default_value = "recipe.yaml")]
    pub recipe: Utf8PathBuf,

    /// Local artifact directory to load builds from
    #[arg(long)]
    pub artifact_dir: Utf8PathBuf,

    /// Run without interactive selections (newest build wins)
    #[arg(short, long)]
    pub auto: bool,

    /// Load a linux build, filtering registered names by this pattern
    #[arg(short, long, value_name = "NAME")]
    pub linux: Option<String>,

    /// Load a u-boot build, filtering registered names by this pattern
    #[arg(short, long, value_name = "NAME")]
    pub uboot: Option<String>,

    /// Load a misc build, filtering registered names by this pattern
    #[arg(short, long, value_name = "NAME")]
    pub misc: Option<String>,

    /// Load a rootfs build, filtering registered names by this pattern
    #[arg(short, long, value_name = "NAME")]
    pub rootfs: Option<String>,

    /// Partition and format only; skip the load phase
    #[arg(long, conflicts_with = "load_only")]
    pub prepare_only: bool,

    /// Load onto existing partitions; skip the destructive prepare phase
    #[arg(long)]
    pub load_only: bool,

    /// Set the log level
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the recipe file to validate
    #[arg(short = 'f', long, default_value = "recipe.yaml")]
    pub recipe: Utf8PathBuf,

    /// Set the log level
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Log levels mapping directly onto the `tracing` crate's levels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
