//! Cache capabilities: key derivation, memory tiers and disk partitions.

pub mod disk;
pub mod key;
pub mod memory;

pub use disk::{DiskCache, FileDiskCache};
pub use key::{BitmapCacheKey, CacheKey, CacheKeyFactory, DefaultCacheKeyFactory};
pub use memory::{CacheWeight, LruMemoryCache, MemoryCache};
