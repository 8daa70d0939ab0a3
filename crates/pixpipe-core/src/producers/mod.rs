//! Pipeline stages.
//!
//! Every stage implements [`Producer`]: it receives a consumer and a
//! per-request [`ProducerContext`], does its part, and either answers itself
//! or asks the next stage, wrapping the consumer to post-process results on
//! the way back. Chains are assembled by [`crate::sequence`].

pub mod base;
pub mod cache;
pub mod context;
pub mod decode;
pub mod disk;
pub mod fetch;
pub mod job;
pub mod listener;
pub mod multiplex;
pub mod network;
pub mod postprocess;
pub mod schedule;
pub mod transform;
pub mod util;

pub use base::{Consumer, ConsumerRef, Envelope, Origin, Producer, ProducerRef, Status, TerminalGuard};
pub use cache::{
    BitmapKeyKind, BitmapMemoryCache, BitmapMemoryCacheGetProducer, BitmapMemoryCacheProducer,
    EncodedMemoryCache, EncodedMemoryCacheProducer,
};
pub use context::{ContextCallbacks, ContextSettings, OnCancel, ProducerContext};
pub use decode::DecodeProducer;
pub use disk::{DiskCachePartitions, DiskCacheProducer};
pub use fetch::{
    LocalFetchProducer, NoVideoFrameExtractor, VideoFrameExtractor, VideoFrameProducer,
    VideoThumbnailKind,
};
pub use job::JobScheduler;
pub use listener::{
    ForwardingRequestListener, NoopRequestListener, RequestListener, TracingRequestListener,
};
pub use multiplex::MultiplexProducer;
pub use network::NetworkFetchProducer;
pub use postprocess::{
    BlurPostprocessor, GrayscalePostprocessor, Postprocessor, PostprocessorProducer,
};
pub use schedule::{
    BranchOnSeparateImagesProducer, BranchProducer, ImageDimensions, SeparateImagesMode,
    ThreadHandoffProducer, ThrottlingProducer,
};
pub use transform::{
    AddMetaProducer, RemoveMetaProducer, ResizeAndRotateProducer, WebpTranscodeProducer,
};
pub use util::{NullProducer, SwallowResultProducer};
