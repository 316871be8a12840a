//! gotya - a lightweight personal artifact manager CLI

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gotya::config::Config;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "gotya")]
#[command(author, version, about = "gotya - a lightweight personal artifact manager")]
struct Cli {
    /// Configuration file (defaults to ~/.gotya/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync repository indexes
    Sync,
    /// Install artifacts
    Install {
        /// Artifact name(s), optionally with a constraint: name or name:>=1.0.0
        #[arg(required = true)]
        requests: Vec<String>,
        /// Resolve and report without applying
        #[arg(long)]
        dry_run: bool,
        /// Override the cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Download parallelism (0 = auto)
        #[arg(long, default_value_t = 0)]
        concurrency: usize,
    },
    /// Uninstall artifacts
    Uninstall {
        /// Artifact name(s)
        #[arg(required = true)]
        names: Vec<String>,
        /// Also remove meta directories and emptied payload directories
        #[arg(long)]
        purge: bool,
    },
    /// Update artifacts to the newest available versions
    Update {
        /// Artifact name(s); empty requires --all
        names: Vec<String>,
        /// Update every installed artifact
        #[arg(long)]
        all: bool,
        /// Resolve and report without applying
        #[arg(long)]
        dry_run: bool,
        /// Download parallelism (0 = auto)
        #[arg(long, default_value_t = 0)]
        concurrency: usize,
    },
    /// List installed artifacts
    List {
        /// Only names starting with this prefix
        #[arg(long)]
        name: Option<String>,
    },
    /// Search available artifacts
    Search {
        /// Search query
        query: String,
    },
    /// Remove orphaned automatic artifacts
    Cleanup {
        /// Resolve and report without applying
        #[arg(long)]
        dry_run: bool,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Artifact authoring
    Artifact {
        #[command(subcommand)]
        command: ArtifactCommands,
    },
    /// Repository index authoring
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Print the gotya version
    Version,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show cache location and sizes
    Info,
    /// Print the cache directory path
    Dir,
    /// Remove cached indexes and/or bundles
    Clean {
        /// Remove everything (default)
        #[arg(long)]
        all: bool,
        /// Remove synced indexes only
        #[arg(long)]
        indexes: bool,
        /// Remove cached bundles only
        #[arg(long)]
        packages: bool,
    },
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// Pack a source tree (meta/ + data/) into a bundle
    Create {
        /// Source directory containing meta/ and optionally data/
        source_dir: PathBuf,
        /// Directory the bundle is written into
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Artifact name
        #[arg(long)]
        name: String,
        /// Semver version
        #[arg(long)]
        version: String,
        /// Target os token (defaults to the host)
        #[arg(long)]
        os: Option<String>,
        /// Target arch token (defaults to the host)
        #[arg(long)]
        arch: Option<String>,
        /// Maintainer contact
        #[arg(long, default_value = "")]
        maintainer: String,
        /// Description
        #[arg(long, default_value = "")]
        description: String,
        /// Dependency, repeatable: name or name:>=1.0.0
        #[arg(long = "depends")]
        dependencies: Vec<String>,
        /// Hook, repeatable: <hook-name>=<script under meta/>
        #[arg(long = "hook")]
        hooks: Vec<String>,
    },
    /// Verify a bundle's manifest and checksums
    Verify {
        /// Bundle path
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Generate an index over a directory of bundles
    Generate {
        /// Directory containing .gotya bundles
        artifacts_dir: PathBuf,
        /// Output index file
        output: PathBuf,
        /// Prefix prepended to every entry url
        #[arg(long)]
        base_path: Option<String>,
        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the configuration as TOML
    Show,
    /// Print one key
    Get {
        /// Key, e.g. cache_dir or platform.os
        key: String,
    },
    /// Set one key and persist
    Set {
        /// Key, e.g. cache_dir or platform.os
        key: String,
        /// New value
        value: String,
    },
    /// Write a fresh default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync => cmd::sync::sync(config).await,
        Commands::Install {
            requests,
            dry_run,
            cache_dir,
            concurrency,
        } => cmd::install::install(config, &requests, dry_run, cache_dir, concurrency).await,
        Commands::Uninstall { names, purge } => {
            cmd::uninstall::uninstall(config, &names, purge).await
        }
        Commands::Update {
            names,
            all,
            dry_run,
            concurrency,
        } => cmd::update::update(config, &names, all, dry_run, concurrency).await,
        Commands::List { name } => cmd::list::list(&config, name.as_deref()),
        Commands::Search { query } => cmd::search::search(&config, &query),
        Commands::Cleanup { dry_run } => cmd::cleanup::cleanup(config, dry_run).await,
        Commands::Cache { command } => match command {
            CacheCommands::Info => cmd::cache::info(&config),
            CacheCommands::Dir => {
                cmd::cache::dir(&config);
                Ok(())
            }
            CacheCommands::Clean {
                all,
                indexes,
                packages,
            } => {
                let target = if indexes && !packages && !all {
                    cmd::cache::CleanTarget::Indexes
                } else if packages && !indexes && !all {
                    cmd::cache::CleanTarget::Packages
                } else {
                    cmd::cache::CleanTarget::All
                };
                cmd::cache::clean(&config, target)
            }
        },
        Commands::Artifact { command } => match command {
            ArtifactCommands::Create {
                source_dir,
                output_dir,
                name,
                version,
                os,
                arch,
                maintainer,
                description,
                dependencies,
                hooks,
            } => cmd::artifact::create(
                &source_dir,
                &output_dir,
                &name,
                &version,
                os.as_deref(),
                arch.as_deref(),
                &maintainer,
                &description,
                &dependencies,
                &hooks,
            ),
            ArtifactCommands::Verify { path } => cmd::artifact::verify(&path),
        },
        Commands::Index { command } => match command {
            IndexCommands::Generate {
                artifacts_dir,
                output,
                base_path,
                force,
            } => cmd::index::generate(&artifacts_dir, &output, base_path, force),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd::config::show(&config),
            ConfigCommands::Get { key } => cmd::config::get(&config, &key),
            ConfigCommands::Set { key, value } => {
                let mut config = config;
                cmd::config::set(&mut config, &config_path, &key, &value)
            }
            ConfigCommands::Init { force } => cmd::config::init(&config_path, force),
        },
        Commands::Version => {
            println!("gotya {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
