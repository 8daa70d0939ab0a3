//! Reference-counted pooled byte buffers.

use std::fmt;
use std::io::{self, Read, Write};
use std::ops::Deref;
use std::sync::Arc;

use super::BufferPool;

/// Largest pre-size a writer asks the pool for.
///
/// Lengths come from untrusted headers and file metadata; writers grow past
/// this on demand.
pub const MAX_PRESIZE: usize = 4 * 1024 * 1024;

/// Default pre-size when no length is known.
pub const DEFAULT_PRESIZE: usize = 16 * 1024;

/// Shared handle to a pooled buffer. Clone to add a reference, drop to close it.
pub type BufferRef = Arc<PooledBuffer>;

/// Immutable bytes borrowed from a [`BufferPool`].
pub struct PooledBuffer {
    bytes: Vec<u8>,
    pool: Arc<dyn BufferPool>,
}

impl PooledBuffer {
    /// Take ownership of `bytes`; they are handed to `pool` on drop.
    pub fn adopt(bytes: Vec<u8>, pool: Arc<dyn BufferPool>) -> BufferRef {
        Arc::new(Self { bytes, pool })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.bytes));
    }
}

/// Growable writer whose storage comes from the pool.
pub struct PooledBufferWriter {
    bytes: Option<Vec<u8>>,
    pool: Arc<dyn BufferPool>,
}

impl PooledBufferWriter {
    pub fn len(&self) -> usize {
        self.bytes.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the bytes written so far into a new buffer; the writer keeps going.
    pub fn snapshot(&self) -> BufferRef {
        let written = self.bytes.as_deref().unwrap_or_default();
        let mut copy = self.pool.acquire(written.len());
        copy.extend_from_slice(written);
        PooledBuffer::adopt(copy, Arc::clone(&self.pool))
    }

    /// Finish writing and hand the storage over without copying.
    pub fn into_buffer(mut self) -> BufferRef {
        let bytes = self.bytes.take().unwrap_or_default();
        PooledBuffer::adopt(bytes, Arc::clone(&self.pool))
    }
}

impl Write for PooledBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.bytes.as_mut() {
            Some(bytes) => {
                bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writer already finished",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PooledBufferWriter {
    fn drop(&mut self) {
        if let Some(bytes) = self.bytes.take() {
            self.pool.release(bytes);
        }
    }
}

/// Allocates pooled buffers and writers from one pool.
#[derive(Clone)]
pub struct PooledBufferFactory {
    pool: Arc<dyn BufferPool>,
}

impl PooledBufferFactory {
    pub fn new(pool: Arc<dyn BufferPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<dyn BufferPool> {
        &self.pool
    }

    /// Writer pre-sized for `capacity` bytes, up to [`MAX_PRESIZE`].
    pub fn writer(&self, capacity: usize) -> PooledBufferWriter {
        PooledBufferWriter {
            bytes: Some(self.pool.acquire(capacity.min(MAX_PRESIZE))),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Copy `bytes` into a pooled buffer.
    pub fn from_slice(&self, bytes: &[u8]) -> BufferRef {
        let mut storage = self.pool.acquire(bytes.len());
        storage.extend_from_slice(bytes);
        PooledBuffer::adopt(storage, Arc::clone(&self.pool))
    }

    /// Drain `reader` into a pooled buffer, pre-sized when `length` is known.
    pub fn from_reader(&self, mut reader: impl Read, length: Option<u64>) -> io::Result<BufferRef> {
        let capacity = length
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or(DEFAULT_PRESIZE);
        let mut writer = self.writer(capacity);
        io::copy(&mut reader, &mut writer)?;
        Ok(writer.into_buffer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TrackingPool;
    use std::io::Cursor;

    #[test]
    fn test_last_reference_releases_once() {
        let pool = Arc::new(TrackingPool::default());
        let factory = PooledBufferFactory::new(pool.clone());
        let buffer = factory.from_slice(b"abc");

        let holders: Vec<BufferRef> = (0..3).map(|_| Arc::clone(&buffer)).collect();
        drop(buffer);
        assert_eq!(pool.released(), 0);

        let mut holders = holders.into_iter();
        holders.next();
        holders.next();
        assert_eq!(pool.released(), 0);
        drop(holders);
        assert_eq!(pool.released(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_from_reader_presizes() {
        let pool = Arc::new(TrackingPool::default());
        let factory = PooledBufferFactory::new(pool.clone());
        let data = vec![7u8; 1000];
        let buffer = factory
            .from_reader(Cursor::new(data.clone()), Some(1000))
            .unwrap();
        assert_eq!(buffer.as_slice(), data.as_slice());
        assert_eq!(pool.requested_capacities(), vec![1000]);
    }

    #[test]
    fn test_advertised_length_presize_is_capped() {
        let pool = Arc::new(TrackingPool::default());
        let factory = PooledBufferFactory::new(pool.clone());
        let buffer = factory
            .from_reader(Cursor::new(b"tiny".to_vec()), Some(1 << 46))
            .unwrap();
        assert_eq!(buffer.as_slice(), b"tiny");
        assert_eq!(pool.requested_capacities(), vec![MAX_PRESIZE]);
    }

    #[test]
    fn test_snapshot_copies_and_writer_continues() {
        let pool = Arc::new(TrackingPool::default());
        let factory = PooledBufferFactory::new(pool.clone());
        let mut writer = factory.writer(4);
        writer.write_all(b"ab").unwrap();
        let partial = writer.snapshot();
        writer.write_all(b"cd").unwrap();
        let full = writer.into_buffer();

        assert_eq!(partial.as_slice(), b"ab");
        assert_eq!(full.as_slice(), b"abcd");
        drop(partial);
        drop(full);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_abandoned_writer_returns_storage() {
        let pool = Arc::new(TrackingPool::default());
        let factory = PooledBufferFactory::new(pool.clone());
        let mut writer = factory.writer(16);
        writer.write_all(b"partial").unwrap();
        drop(writer);
        assert_eq!(pool.outstanding(), 0);
    }
}
