//! Subcommand implementations.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod prefetch;

use pixpipe_core::{Config, ImagePipeline};
use tokio::runtime::Handle;

/// Pipeline with the default collaborators on the current runtime.
pub(crate) fn build_pipeline(config: Config) -> anyhow::Result<ImagePipeline> {
    let pipeline = ImagePipeline::from_config(config, Handle::current())?;
    tracing::debug!(
        "Pipeline ready (disk cache: {})",
        pipeline.config().main_disk_cache_dir().display()
    );
    Ok(pipeline)
}
