//! # Boardcache Caching infrastructure
//!
//! Imageboard clients request the same thumbnails, images and thread JSON over and over, often
//! from many places of the UI at once. This module includes all the code that deals with the
//! different layers of caching, our central [`CacheError`] type, and an explanation of how all
//! this works.
//!
//! ## Cache Layers
//!
//! Boardcache has a two-layered caching architecture:
//!
//! - An in-memory layer, the [`RequestCoalescingCache`], which deduplicates concurrent requests
//!   for the same resource and keeps decoded payloads in a weighted LRU.
//! - A file-system layer, the [`ResponseCache`], which persists raw response bodies below the
//!   [`Transport`](crate::download::Transport). The in-memory layer treats it as part of the
//!   opaque transport.
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory layer. A hit is delivered right away.
//! - On miss, it attaches to the running fetch of the same key, if there is one.
//! - Otherwise, a new fetch is started. The transport tries the file-system layer, and
//!   downloads the resource on miss, storing the body on the file-system.
//! - The body is decoded on a blocking thread, inserted into the LRU, and only then all
//!   attached listeners are notified, in the order they were attached.
//!
//! ### Metrics
//!
//! We collect a couple of metrics, each of those is tagged with a `cache` field that corresponds
//! to the [`CacheName`]:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.coalesced`: Accesses that attached to an already running fetch.
//! - `caches.computation`: Actual fetches being run.
//! - `caches.memory.evicted`: Entries removed from the in-memory layer.
//! - `caches.cancelled`: Listeners that were cancelled before being notified.
//! - `caches.file.hit`, `caches.file.write`, `caches.file.size`: File-system layer activity.
//! - `caches.size.*`: Gauges and counters emitted by [`cleanup`].
//!
//! ### Configuration
//!
//! The capacity of each in-memory cache is configured explicitly, in bytes of decoded payload.
//! The file-system layer is gated by the [`Config::cache_dir`](crate::config::Config::cache_dir)
//! option. Cached responses use a time-to-idle expiration based on `mtime`, which is bumped
//! once an hour for responses that are in use.
//!
//! Independently of that, each response carries its HTTP freshness. A response is served from
//! disk only while the `max-age` of its `Cache-Control` header has not elapsed. After that, it
//! is revalidated with a conditional request, and a `304 Not Modified` keeps the stored body.
//!
//! ## [`CacheEntry`] / [`CacheError`]
//!
//! The caching layer primarily deals with [`CacheEntry`]s, which are just an alias for a
//! [`Result`] around a [`CacheError`].
//!
//! Errors are never cached, neither in memory nor on disk. A failure is terminal for the
//! current attempt only, and the next request starts over. [`CacheError::NotFound`] is
//! distinguished from generic failures so callers can render a different fallback.
//!
//! ## Cancellation
//!
//! Each request returns a [`RequestHandle`]. Cancelling it detaches only that listener, and
//! once acknowledged, the listener is guaranteed to never run. When the last listener of a
//! fetch is gone, the fetch is aborted, and any result that still arrives is discarded.

mod cache_error;
mod cache_key;
mod cleanup;
mod config;
mod dispatch;
mod fs;
mod lru;
mod memory;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::CacheKey;
pub use cleanup::{CleanupStats, cleanup};
pub use config::{CacheName, CacheSettings};
pub use dispatch::{CallbackQueue, Dispatch, Inline, QueueDispatch, RuntimeDispatch, Task};
pub use fs::{CachedResponse, ResponseCache, ResponseMetadata};
pub use lru::WeightedLru;
pub use memory::{CacheStats, Listener, ProgressListener, RequestCoalescingCache, RequestHandle};
