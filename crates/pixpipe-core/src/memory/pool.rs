//! Buffer pools.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Source of reusable byte vectors.
///
/// Implementations must be thread-safe: buffers are acquired and released
/// from every executor concurrently.
pub trait BufferPool: Send + Sync {
    /// Get an empty vector with at least `capacity` bytes of capacity.
    fn acquire(&self, capacity: usize) -> Vec<u8>;

    /// Return a vector once no reference to it remains.
    fn release(&self, buffer: Vec<u8>);
}

/// Smallest bucket handed out by [`SharedBufferPool`].
const MIN_BUCKET: usize = 4 * 1024;

/// Power-of-two bucketed pool with a cap on retained bytes.
pub struct SharedBufferPool {
    max_retained_bytes: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    buckets: BTreeMap<usize, Vec<Vec<u8>>>,
    retained_bytes: usize,
}

impl SharedBufferPool {
    pub fn new(max_retained_bytes: usize) -> Self {
        Self {
            max_retained_bytes,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Bytes currently parked in the pool.
    pub fn retained_bytes(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retained_bytes
    }

    /// `None` when no power of two can hold `capacity`.
    fn bucket_for(capacity: usize) -> Option<usize> {
        capacity.max(MIN_BUCKET).checked_next_power_of_two()
    }
}

impl Default for SharedBufferPool {
    fn default() -> Self {
        Self::new(8 * 1024 * 1024)
    }
}

impl BufferPool for SharedBufferPool {
    fn acquire(&self, capacity: usize) -> Vec<u8> {
        let Some(bucket) = Self::bucket_for(capacity) else {
            return Vec::with_capacity(capacity);
        };
        let reused = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let reused = state.buckets.get_mut(&bucket).and_then(Vec::pop);
            if reused.is_some() {
                state.retained_bytes -= bucket;
            }
            reused
        };
        reused.unwrap_or_else(|| Vec::with_capacity(bucket))
    }

    fn release(&self, mut buffer: Vec<u8>) {
        let capacity = buffer.capacity();
        // Only exact bucket sizes are recycled; grown vectors are freed.
        if capacity < MIN_BUCKET || !capacity.is_power_of_two() {
            return;
        }
        buffer.clear();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.retained_bytes + capacity > self.max_retained_bytes {
            return;
        }
        state.retained_bytes += capacity;
        state.buckets.entry(capacity).or_default().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_rounds_to_bucket() {
        let pool = SharedBufferPool::default();
        let buf = pool.acquire(5000);
        assert!(buf.capacity() >= 8192);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let pool = SharedBufferPool::default();
        let mut buf = pool.acquire(10_000);
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.retained_bytes(), 16 * 1024);

        let again = pool.acquire(9_000);
        assert_eq!(again.as_ptr(), ptr);
        assert!(again.is_empty());
        assert_eq!(pool.retained_bytes(), 0);
    }

    #[test]
    fn test_bucket_overflow_is_not_rounded() {
        assert_eq!(SharedBufferPool::bucket_for(5000), Some(8192));
        assert_eq!(SharedBufferPool::bucket_for(usize::MAX), None);
    }

    #[test]
    fn test_retention_cap() {
        let pool = SharedBufferPool::new(MIN_BUCKET);
        pool.release(Vec::with_capacity(MIN_BUCKET));
        pool.release(Vec::with_capacity(MIN_BUCKET));
        assert_eq!(pool.retained_bytes(), MIN_BUCKET);
    }
}
