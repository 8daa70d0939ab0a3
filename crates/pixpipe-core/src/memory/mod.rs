//! Pooled byte buffers.
//!
//! Encoded image bytes live in [`PooledBuffer`]s shared as [`BufferRef`]
//! (`Arc<PooledBuffer>`). Cloning the `Arc` is taking a new reference;
//! dropping it is closing that reference. The underlying `Vec<u8>` goes back
//! to its [`BufferPool`] exactly when the last reference is dropped.

mod buffer;
mod pool;

pub use buffer::{
    BufferRef, DEFAULT_PRESIZE, MAX_PRESIZE, PooledBuffer, PooledBufferFactory, PooledBufferWriter,
};
pub use pool::{BufferPool, SharedBufferPool};
