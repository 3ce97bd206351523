//! Turning fetched bytes into cacheable payloads.

use bytes::Bytes;

use crate::caching::CacheEntry;

mod bitmap;

pub use bitmap::{Bitmap, ImageDecoder};

/// Hints passed along to a [`Decoder`].
///
/// A dimension of `0` means "unconstrained".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeHints {
    /// The width the payload will be displayed at.
    pub width: u32,
    /// The height the payload will be displayed at.
    pub height: u32,
}

impl DecodeHints {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether these hints ask for any resizing at all.
    pub fn is_constrained(&self) -> bool {
        self.width > 0 || self.height > 0
    }
}

/// Decodes the raw bytes of a resource into an in-memory payload.
///
/// Decoding runs on a blocking thread, so implementations are free to do CPU heavy work.
pub trait Decoder: Send + Sync + 'static {
    /// The decoded payload that is kept in memory.
    type Payload: Send + Sync + 'static;

    fn decode(&self, data: Bytes, hints: &DecodeHints) -> CacheEntry<Self::Payload>;

    /// The "cost" of keeping `payload` in the in-memory cache, usually its size in bytes.
    fn weight(payload: &Self::Payload) -> u64;
}

/// Keeps the response body as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Payload = Bytes;

    fn decode(&self, data: Bytes, _hints: &DecodeHints) -> CacheEntry<Bytes> {
        Ok(data)
    }

    fn weight(payload: &Bytes) -> u64 {
        payload.len() as u64
    }
}
