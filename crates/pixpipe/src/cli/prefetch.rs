//! The `pixpipe prefetch` command: warm the disk cache.

use clap::Args;
use futures_util::future::join_all;
use pixpipe_core::{Config, ImageRequest};

use super::build_pipeline;

#[derive(Args, Debug)]
pub struct PrefetchArgs {
    /// Network URIs to download
    #[arg(required = true)]
    pub uris: Vec<String>,
}

pub async fn execute(args: PrefetchArgs, config: Config) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config)?;

    let results = join_all(args.uris.iter().map(|uri| {
        let pipeline = &pipeline;
        async move {
            let request = ImageRequest::from_uri(uri)?;
            if !uri.starts_with("http://") && !uri.starts_with("https://") {
                tracing::warn!("{uri} is not a network image; nothing to prefetch");
            }
            pipeline.prefetch_to_disk_cache(request).await
        }
    }))
    .await;

    let mut failed = 0;
    for (uri, result) in args.uris.iter().zip(&results) {
        match result {
            Ok(()) => println!("  cached {uri}"),
            Err(e) => {
                failed += 1;
                println!("  FAIL   {uri}  {e}");
            }
        }
    }
    tracing::info!("Prefetched {} of {} images", results.len() - failed, results.len());

    if failed > 0 {
        anyhow::bail!("{failed} of {} prefetches failed", results.len());
    }
    Ok(())
}
