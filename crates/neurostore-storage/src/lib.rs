//! Storage layer for neurostore
//!
//! - [`backend`]: the pluggable [`backend::ObjectBackend`] trait plus
//!   in-memory and local-filesystem implementations
//! - [`blob`]: content-addressed immutable byte storage
//! - [`cache`]: two-tier hot/warm cache manager
//! - [`write_buffer`] / [`coalescer`]: write batching and read
//!   deduplication for cloud-style backends
//! - [`backpressure`]: admission control over backend calls
//! - [`engine`]: the sharded storage engine (spec.md §4.6)
//! - [`shutdown`]: process-wide shutdown hooks that flush counts for every
//!   live engine instance (spec.md §5, Design Notes §9)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod backpressure;
pub mod blob;
pub mod cache;
pub mod coalescer;
pub mod engine;
pub mod shutdown;
pub mod write_buffer;

pub use backend::{BatchConfig, MemoryBackend, LocalFsBackend, ObjectBackend, RateLimit};
pub use backpressure::Backpressure;
pub use blob::BlobStore;
pub use cache::CacheManager;
pub use coalescer::ReadCoalescer;
pub use engine::{Counts, Page, Pagination, StorageEngine};
pub use write_buffer::WriteBuffer;
