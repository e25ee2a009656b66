//! Configuration types for screendb
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Build configuration with validation

use crate::error::ConfigError;
use crate::store::CreationMode;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Maximum reasonable ingestion thread count
pub const MAX_THREADS: usize = 256;

/// Screening database builder
#[derive(Parser, Debug, Clone)]
#[command(
    name = "screendb",
    version,
    about = "Build deduplicated screening databases from record streams",
    long_about = "Builds a SQLite screening database from a JSON-lines record stream.\n\n\
                  Records are deduplicated by content hash. With --threads, ingestion runs on\n\
                  several threads writing to temporary stores that are merged at the end.",
    after_help = "EXAMPLES:\n    \
        screendb build records.jsonl -o screen.db\n    \
        screendb build records.jsonl -o screen.db --drop-duplicates -j 8\n    \
        screendb build more.jsonl -o screen.db --mode append --drop-duplicates\n    \
        screendb info screen.db"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build or extend a database from a record stream
    Build(BuildArgs),

    /// Show the contents and build metadata of a database
    Info {
        /// Database file
        #[arg(value_name = "DB")]
        db: PathBuf,
    },
}

/// Arguments of the `build` subcommand
#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// JSON-lines record file
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output database file
    #[arg(short, long, default_value = "screen.db", value_name = "FILE")]
    pub output: PathBuf,

    /// How to treat an existing output database
    #[arg(short, long, value_enum, default_value_t = CreationMode::Create)]
    pub mode: CreationMode,

    /// Reject records whose content hash is already present
    #[arg(long)]
    pub drop_duplicates: bool,

    /// Ingestion threads (0 = single-threaded, no temporary stores)
    #[arg(short = 'j', long, default_value_t = 0, value_name = "NUM")]
    pub threads: usize,

    /// Directory for temporary stores
    #[arg(long, value_name = "DIR", default_value_os_t = std::env::temp_dir())]
    pub tmp_dir: PathBuf,
}

/// Validated build configuration
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Output database path
    pub output_path: PathBuf,

    pub mode: CreationMode,

    /// Reject records whose content hash is already present
    pub drop_duplicates: bool,

    /// Ingestion threads; 0 runs on the calling thread
    pub num_threads: usize,

    /// Directory for temporary stores
    pub tmp_dir: PathBuf,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl BuildConfig {
    /// Defaults for a single-threaded CREATE build into `output_path`
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            mode: CreationMode::Create,
            drop_duplicates: false,
            num_threads: 0,
            tmp_dir: std::env::temp_dir(),
            show_progress: false,
            verbose: false,
        }
    }

    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &BuildArgs, quiet: bool, verbose: bool) -> Result<Self, ConfigError> {
        validate_input(&args.input)?;

        let config = Self {
            output_path: args.output.clone(),
            mode: args.mode,
            drop_duplicates: args.drop_duplicates,
            num_threads: args.threads,
            tmp_dir: args.tmp_dir.clone(),
            show_progress: !quiet,
            verbose,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration against the filesystem
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads > MAX_THREADS {
            return Err(ConfigError::InvalidThreadCount {
                count: self.num_threads,
                max: MAX_THREADS,
            });
        }

        if let Some(parent) = self.output_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(ConfigError::InvalidOutputPath {
                    path: self.output_path.clone(),
                    reason: format!("Parent directory '{}' does not exist", parent.display()),
                });
            }
        }

        if self.output_path.is_dir() {
            return Err(ConfigError::InvalidOutputPath {
                path: self.output_path.clone(),
                reason: "Path is a directory".to_string(),
            });
        }

        if self.mode != CreationMode::Create && !self.output_path.exists() {
            return Err(ConfigError::InvalidOutputPath {
                path: self.output_path.clone(),
                reason: format!("{} mode needs an existing database", self.mode),
            });
        }

        if self.num_threads > 1 && !self.tmp_dir.is_dir() {
            return Err(ConfigError::InvalidTmpDir {
                path: self.tmp_dir.clone(),
                reason: "Not an existing directory".to_string(),
            });
        }

        Ok(())
    }
}

fn validate_input(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::InvalidInput {
            path: path.to_path_buf(),
            reason: "File does not exist".to_string(),
        });
    }
    Ok(())
}
