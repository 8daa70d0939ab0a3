//! pixpipe core - an embeddable image loading pipeline.
//!
//! A request for an image travels down a chain of producers, each owning one
//! concern, until some stage can answer it:
//!
//! ```text
//! bitmap cache → decode → encoded cache → disk cache → network / local fetch
//! ```
//!
//! Results flow back up through consumers. Identical in-flight requests share
//! one upstream fetch, progressive JPEGs yield intermediate images, and every
//! image buffer returns to its pool once the last reference is dropped.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pixpipe_core::{Config, ImagePipeline, ImageRequest};
//!
//! #[tokio::main]
//! async fn main() -> pixpipe_core::Result<()> {
//!     let config = Config::load()?;
//!     let pipeline = ImagePipeline::from_config(config, tokio::runtime::Handle::current())?;
//!
//!     let request = ImageRequest::builder("https://example.com/cat.jpg")?
//!         .resize(256, 256)
//!         .build();
//!     if let Some(image) = pipeline.fetch_decoded_image(request).await?.payload() {
//!         println!("{}x{}", image.width(), image.height());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod producers;
pub mod request;
pub mod sequence;
pub mod source;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use error::{CacheError, ConfigError, PipelineError, PipelineResult, PixpipeError, Result};
pub use image::{CloseableImage, EncodedImage, ImageRef, QualityInfo, TransformMetadata};
pub use memory::BufferRef;
pub use pipeline::{ImagePipeline, Outcome, RequestHandle};
pub use producers::{
    BlurPostprocessor, Consumer, ConsumerRef, Envelope, GrayscalePostprocessor, Origin,
    Postprocessor, RequestListener, Status,
};
pub use request::{CacheChoice, ImageRequest, Priority, RequestLevel, ResizeOptions};
pub use sequence::{Capabilities, ProducerSequences};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_from_default_config() {
        let pipeline =
            ImagePipeline::from_config(Config::default(), tokio::runtime::Handle::current())
                .unwrap();
        assert!(pipeline.config().decode.progressive_enabled);
    }
}
