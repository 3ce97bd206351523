//! Provides the boardcache services and a way to initialize them.
//!
//! The main [`create_service`] fn creates the transport, the in-memory caches and the thread
//! snapshot store according to the provided [`Config`], and returns them bundled as
//! [`BoardServices`].
//!
//! Fetches and decoding run on the provided runtime, which should be dedicated to I/O and
//! blocking work, while listeners run on the provided [`Dispatch`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use crate::caching::{CacheName, CacheSettings, Dispatch, RequestCoalescingCache};
use crate::config::Config;
use crate::decode::{BytesDecoder, ImageDecoder};
use crate::download::HttpTransport;
use crate::threads::SnapshotStore;

/// The in-memory cache of decoded images.
pub type ImageCache = RequestCoalescingCache<ImageDecoder>;

/// The in-memory cache of raw response bodies.
pub type RawCache = RequestCoalescingCache<BytesDecoder>;

/// All services sharing one transport.
#[derive(Debug, Clone)]
pub struct BoardServices {
    pub transport: Arc<HttpTransport>,
    pub images: ImageCache,
    pub raw: RawCache,
    pub threads: SnapshotStore,
}

pub fn create_service(
    config: &Config,
    io_pool: Handle,
    dispatch: Arc<dyn Dispatch>,
) -> Result<BoardServices> {
    let transport = Arc::new(HttpTransport::from_config(config)?);
    if let Some(responses) = transport.responses() {
        responses
            .clear_tmp()
            .context("failed to clear tmp caches")?;
    }

    let in_memory = &config.caches.in_memory;
    let images = RequestCoalescingCache::new(
        CacheSettings::new(CacheName::Images, in_memory.images_capacity),
        transport.clone(),
        ImageDecoder::new(in_memory.decode_memory_limit),
        Arc::clone(&dispatch),
        io_pool.clone(),
    );
    let raw = RequestCoalescingCache::new(
        CacheSettings::new(CacheName::Raw, in_memory.raw_capacity),
        transport.clone(),
        BytesDecoder,
        dispatch,
        io_pool,
    );

    Ok(BoardServices {
        transport,
        images,
        raw,
        threads: SnapshotStore::default(),
    })
}
