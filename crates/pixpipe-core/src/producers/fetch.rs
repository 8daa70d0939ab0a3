//! Local fetch stages: files, content URIs, assets, resources, data URIs,
//! EXIF thumbnails and video frames.

use std::io;
use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;

use crate::error::PipelineError;
use crate::executor::Executor;
use crate::image::{CloseableImage, EncodedImage, ImageRef, TransformMetadata};
use crate::memory::PooledBufferFactory;
use crate::request::ImageSource;
use crate::source::LocalSource;

use super::base::{ConsumerRef, Envelope, Origin, Producer};
use super::context::ProducerContext;

/// Reads a local source into a pooled buffer on the local-read executor.
pub struct LocalFetchProducer {
    source: Arc<dyn LocalSource>,
    factory: PooledBufferFactory,
    executor: Arc<dyn Executor>,
}

impl LocalFetchProducer {
    pub fn new(
        source: Arc<dyn LocalSource>,
        factory: PooledBufferFactory,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            source,
            factory,
            executor,
        }
    }
}

impl Producer<EncodedImage> for LocalFetchProducer {
    fn produce_results(&self, consumer: ConsumerRef<EncodedImage>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);
        let source = Arc::clone(&self.source);
        let factory = self.factory.clone();

        self.executor.execute(Box::new(move || {
            let listener = context.listener();
            if context.is_cancelled() {
                listener.on_producer_finish_with_cancellation(context.id(), name);
                consumer.on_cancellation();
                return;
            }

            let request = context.request();
            let read = source.open(request.source()).and_then(|opened| {
                opened
                    .map(|stream| factory.from_reader(stream.reader, stream.length))
                    .transpose()
            });

            match read {
                Ok(Some(buffer)) => {
                    listener.on_producer_finish_with_success(
                        context.id(),
                        name,
                        &[("encoded_size", buffer.len().to_string())],
                    );
                    let encoded = EncodedImage::new(buffer, TransformMetadata::default());
                    consumer.on_new_result(Envelope::final_result(encoded, Origin::Local));
                }
                Ok(None) => {
                    listener.on_producer_finish_with_success(context.id(), name, &[]);
                    consumer.on_new_result(Envelope::no_result(Origin::Local));
                }
                Err(e) => {
                    let error = PipelineError::read_failed(request.uri(), e);
                    listener.on_producer_finish_with_failure(context.id(), name, &error);
                    consumer.on_failure(error);
                }
            }
        }));
    }

    fn name(&self) -> &'static str {
        self.source.name()
    }
}

/// Frame size requested from a [`VideoFrameExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoThumbnailKind {
    /// 96x96
    Micro,
    /// 512x384
    Mini,
}

impl VideoThumbnailKind {
    /// Micro when the requested resize fits in 96x96, Mini otherwise.
    pub fn for_resize(resize: Option<crate::request::ResizeOptions>) -> Self {
        match resize {
            Some(r) if r.width <= 96 && r.height <= 96 => Self::Micro,
            _ => Self::Mini,
        }
    }
}

/// Extracts a representative frame from a video file.
pub trait VideoFrameExtractor: Send + Sync {
    /// `Ok(None)` when the video has no extractable frame.
    fn extract_frame(&self, path: &Path, kind: VideoThumbnailKind)
        -> io::Result<Option<DynamicImage>>;
}

/// Extractor for builds without a video codec: every video yields nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVideoFrameExtractor;

impl VideoFrameExtractor for NoVideoFrameExtractor {
    fn extract_frame(
        &self,
        path: &Path,
        _kind: VideoThumbnailKind,
    ) -> io::Result<Option<DynamicImage>> {
        tracing::debug!("No video codec available for {}", path.display());
        Ok(None)
    }
}

/// Produces a decoded frame of a local video.
pub struct VideoFrameProducer {
    extractor: Arc<dyn VideoFrameExtractor>,
    executor: Arc<dyn Executor>,
}

impl VideoFrameProducer {
    pub fn new(extractor: Arc<dyn VideoFrameExtractor>, executor: Arc<dyn Executor>) -> Self {
        Self {
            extractor,
            executor,
        }
    }
}

impl Producer<ImageRef> for VideoFrameProducer {
    fn produce_results(&self, consumer: ConsumerRef<ImageRef>, context: Arc<ProducerContext>) {
        let name = self.name();
        context.listener().on_producer_start(context.id(), name);
        let extractor = Arc::clone(&self.extractor);

        self.executor.execute(Box::new(move || {
            let listener = context.listener();
            if context.is_cancelled() {
                listener.on_producer_finish_with_cancellation(context.id(), name);
                consumer.on_cancellation();
                return;
            }
            let request = context.request();
            let ImageSource::LocalVideo(path) = request.source() else {
                let error = PipelineError::UnsupportedOperation {
                    uri: request.uri(),
                    operation: "video frame extraction".into(),
                };
                listener.on_producer_finish_with_failure(context.id(), name, &error);
                consumer.on_failure(error);
                return;
            };

            let kind = VideoThumbnailKind::for_resize(request.resize());
            match extractor.extract_frame(path, kind) {
                Ok(Some(frame)) => {
                    listener.on_producer_finish_with_success(
                        context.id(),
                        name,
                        &[("created_thumbnail", "true".to_string())],
                    );
                    consumer.on_new_result(Envelope::final_result(
                        CloseableImage::full(frame),
                        Origin::Local,
                    ));
                }
                Ok(None) => {
                    listener.on_producer_finish_with_success(
                        context.id(),
                        name,
                        &[("created_thumbnail", "false".to_string())],
                    );
                    consumer.on_new_result(Envelope::no_result(Origin::Local));
                }
                Err(e) => {
                    let error = PipelineError::read_failed(request.uri(), e);
                    listener.on_producer_finish_with_failure(context.id(), name, &error);
                    consumer.on_failure(error);
                }
            }
        }));
    }

    fn name(&self) -> &'static str {
        "VideoThumbnailProducer"
    }
}
