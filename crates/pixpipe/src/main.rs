//! pixpipe CLI - load images through the pixpipe pipeline from the shell.
//!
//! # Usage
//!
//! ```bash
//! # Fetch and decode, printing origin and dimensions
//! pixpipe fetch https://example.com/a.jpg ./b.png --width 256 --height 256
//!
//! # Save the decoded images as PNG
//! pixpipe fetch https://example.com/a.jpg --output ./out
//!
//! # Warm the disk cache
//! pixpipe prefetch https://example.com/a.jpg https://example.com/b.jpg
//!
//! # Manage the cache and configuration
//! pixpipe cache clear
//! pixpipe config show
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pixpipe_core::Config;

mod cli;
mod logging;

/// pixpipe - image loading pipeline with memory, disk and network tiers.
#[derive(Parser, Debug)]
#[command(name = "pixpipe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, env = "PIXPIPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load images and print a summary of each
    Fetch(cli::fetch::FetchArgs),

    /// Download images into the disk cache without decoding them
    Prefetch(cli::prefetch::PrefetchArgs),

    /// Inspect or clear the disk cache
    Cache(cli::cache::CacheArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

fn load_config(path: Option<&PathBuf>) -> Config {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    // Logging isn't initialized yet.
    loaded.unwrap_or_else(|e| {
        eprintln!(
            "Warning: Failed to load config: {e}\n  \
             Using default configuration. Check your config file with `pixpipe config path`."
        );
        Config::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref());
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("pixpipe v{}", pixpipe_core::VERSION);

    match cli.command {
        Commands::Fetch(args) => cli::fetch::execute(args, config).await,
        Commands::Prefetch(args) => cli::prefetch::execute(args, config).await,
        Commands::Cache(args) => cli::cache::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args, config, cli.config).await,
    }
}
