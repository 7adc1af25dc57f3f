//! Cinder CLI - Command-line interface for the Cinder asset system

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cache, fetch, parse, resolve, storage};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(about = "Fetch, resolve and cache assets from the command line", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the global and project configs
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the parts of an asset ref
    Parse {
        /// Asset ref (e.g., "Data:textures/wall.png#mip0")
        asset_ref: String,
    },

    /// Resolve an asset ref to its canonical form
    Resolve {
        /// Asset ref to resolve
        asset_ref: String,

        /// Ref to resolve relative paths against
        #[arg(long)]
        context: Option<String>,

        /// Storage descriptors to add before resolving
        #[arg(long)]
        storage: Vec<String>,
    },

    /// Request assets and tick the registry until they settle
    Fetch {
        /// Asset refs to request
        #[arg(required = true)]
        refs: Vec<String>,

        /// Storage descriptors to add before requesting
        #[arg(long)]
        storage: Vec<String>,

        /// Give up after this many ticks
        #[arg(long, default_value = "200")]
        ticks: u32,

        /// Keep running and report reloads until interrupted
        #[arg(long)]
        watch: bool,

        /// Serve every ref from an in-memory provider instead of disk or network
        #[arg(long)]
        mock: bool,

        /// Re-download even if the asset is cached
        #[arg(long)]
        force: bool,
    },

    /// Disk cache operations
    #[command(subcommand)]
    Cache(cache::CacheCommands),

    /// Storage descriptor operations
    #[command(subcommand)]
    Storage(storage::StorageCommands),
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(default_filter))
        .filter_module("ureq", log::LevelFilter::Warn)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Parse { asset_ref } => parse::run(&asset_ref),
        Commands::Resolve {
            asset_ref,
            context,
            storage,
        } => resolve::run(config, &asset_ref, context.as_deref(), &storage),
        Commands::Fetch {
            refs,
            storage,
            ticks,
            watch,
            mock,
            force,
        } => fetch::run(fetch::FetchArgs {
            config: config.map(String::from),
            refs,
            storages: storage,
            ticks,
            watch,
            mock,
            force,
        }),
        Commands::Cache(cmd) => cache::run(config, cmd),
        Commands::Storage(cmd) => storage::run(cmd),
    }
}
