//! tarstash CLI entrypoint.

use clap::Parser;
use console::style;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{BackendKind, Commands, ConfigCommands};
use config::{CliConfig, Overrides};

#[derive(Parser)]
#[command(name = "tarstash")]
#[command(author, version, about = "Directory cache backed by an object store", long_about = None)]
struct Cli {
    /// Log every protocol step
    #[arg(long, global = true)]
    debug: bool,

    /// Store backend
    #[arg(long, global = true, env = "TARSTASH_BACKEND")]
    backend: Option<BackendKind>,

    /// Root directory of the filesystem backend
    #[arg(long, global = true, env = "TARSTASH_FS_ROOT")]
    fs_root: Option<PathBuf>,

    /// S3 endpoint URL, for S3-compatible services
    #[arg(long, global = true, env = "TARSTASH_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long, global = true, env = "TARSTASH_S3_REGION")]
    s3_region: Option<String>,

    /// Give up after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend,
            fs_root: self.fs_root.clone(),
            s3_region: self.s3_region.clone(),
            s3_endpoint: self.s3_endpoint.clone(),
            debug: self.debug,
        }
    }
}

/// Config file with flag and environment overrides applied, plus the load
/// error if the file could not be read.
fn load_config(cli: &Cli) -> (CliConfig, Option<String>) {
    let (mut config, load_error) = match CliConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (CliConfig::default(), Some(e.to_string())),
    };
    config.apply(&cli.overrides());
    (config, load_error)
}

/// Default log filter when `RUST_LOG` is unset.
fn filter_for(config: &CliConfig) -> &'static str {
    if config.debug {
        "debug"
    } else {
        "warn,tarstash=info"
    }
}

fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Token cancelled on Ctrl-C or when the timeout elapses.
fn cancellation(timeout: Option<u64>) -> CancellationToken {
    let token = CancellationToken::new();

    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout {
        let on_timeout = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(secs, "timed out, cancelling");
            on_timeout.cancel();
        });
    }

    token
}

async fn run(cli: Cli, config: CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Commands::Config { command } = cli.command {
        return match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value),
        };
    }

    let cancel = cancellation(cli.timeout);
    let store = handlers::build_store(&config).await;

    match cli.command {
        Commands::Save {
            bucket,
            key,
            dir,
            compression,
        } => {
            handlers::save(&config, store, bucket, key, dir, compression, &cancel).await?;
        }
        Commands::Restore { bucket, keys, dir } => {
            handlers::restore(&config, store, bucket, keys, dir, &cancel).await?
        }
        Commands::HashGlob { pattern } => {
            println!("{}", handlers::hash_glob(&config, store, &pattern, &cancel).await?);
        }
        Commands::HashFiles { paths } => {
            println!("{}", handlers::hash_files(&config, store, paths, &cancel).await?);
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (config, load_error) = load_config(&cli);
    init_tracing(filter_for(&config));
    if let Some(e) = load_error {
        warn!(error = %e, "failed to load config file, using defaults");
    }

    if let Err(e) = run(cli, config).await {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_restore_with_fallbacks() {
        let cli = Cli::try_parse_from([
            "tarstash", "restore", "--bucket", "ci", "--key", "a-v2", "--key", "a-v1", "--dir",
            "target", "--backend", "s3",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(BackendKind::S3));
        match cli.command {
            Commands::Restore { bucket, keys, dir } => {
                assert_eq!(bucket, "ci");
                assert_eq!(keys, vec!["a-v2", "a-v1"]);
                assert_eq!(dir, PathBuf::from("target"));
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn test_parse_save_compression() {
        let cli = Cli::try_parse_from([
            "tarstash", "--debug", "save", "-b", "ci", "-k", "deps", "-d", ".", "-c", "gzip",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Commands::Save { compression, .. } => {
                assert_eq!(compression, Some(tarstash_cache::CompressionType::Gzip));
            }
            _ => panic!("expected save"),
        }

        assert!(
            Cli::try_parse_from(["tarstash", "save", "-b", "ci", "-k", "k", "-d", ".", "-c", "xz"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["tarstash", "restore", "-b", "ci", "-d", "."]).is_err());
    }

    #[test]
    fn test_config_file_debug_sets_log_filter() {
        let cli = Cli::try_parse_from(["tarstash", "hash-files", "Cargo.lock"]).unwrap();
        let mut config = CliConfig {
            debug: true,
            ..CliConfig::default()
        };
        config.apply(&cli.overrides());
        assert_eq!(filter_for(&config), "debug");

        assert_eq!(filter_for(&CliConfig::default()), "warn,tarstash=info");

        let cli = Cli::try_parse_from(["tarstash", "--debug", "hash-files", "x"]).unwrap();
        let mut config = CliConfig::default();
        config.apply(&cli.overrides());
        assert_eq!(filter_for(&config), "debug");
    }
}
