//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;
use tarstash_cache::CompressionType;

#[derive(Subcommand)]
pub enum Commands {
    /// Archive a directory and upload it under a cache key
    Save {
        /// Bucket to save into
        #[arg(short, long)]
        bucket: String,

        /// Cache key; may contain {{ hashGlob "..." }} or {{ hashFiles "..." }}
        #[arg(short, long)]
        key: String,

        /// Directory to cache
        #[arg(short, long)]
        dir: PathBuf,

        /// Compression algorithm (zstd, gzip, lz4, none)
        #[arg(short, long)]
        compression: Option<CompressionType>,
    },

    /// Restore the newest cache matching one of the keys
    Restore {
        /// Bucket to restore from
        #[arg(short, long)]
        bucket: String,

        /// Key prefix; repeat to add fallbacks
        #[arg(short, long = "key", required = true)]
        keys: Vec<String>,

        /// Directory to restore into
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Print the digest of the files matching a glob
    HashGlob {
        pattern: String,
    },

    /// Print the digest of the given files, in order
    HashFiles {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Set a configuration value in the config file
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Filesystem,
    S3,
}
