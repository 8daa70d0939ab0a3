//! The `pixpipe cache` command.

use clap::{Args, Subcommand};
use pixpipe_core::Config;

use super::build_pipeline;

#[derive(Args, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Print the disk cache partition directories
    Path,

    /// Delete every entry from both disk cache partitions
    Clear,

    /// Remove one image from every cache tier
    Evict {
        /// URI of the image
        uri: String,
    },
}

pub async fn execute(args: CacheArgs, config: Config) -> anyhow::Result<()> {
    match args.command {
        CacheCommand::Path => {
            println!("main:  {}", config.main_disk_cache_dir().display());
            println!("small: {}", config.small_disk_cache_dir().display());
        }

        CacheCommand::Clear => {
            let pipeline = build_pipeline(config)?;
            pipeline.clear_disk_caches().await;
            println!("Disk caches cleared");
        }

        CacheCommand::Evict { uri } => {
            let pipeline = build_pipeline(config)?;
            pipeline.evict(&uri).await?;
            println!("Evicted {uri}");
        }
    }

    Ok(())
}
