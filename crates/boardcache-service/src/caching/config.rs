use std::fmt;

/// All known cache names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    /// Decoded images, thumbnails and full size.
    Images,
    /// Raw response bodies, such as board and thread JSON.
    Raw,
    /// The on-disk HTTP response cache below the transport.
    Responses,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Images => "images",
            Self::Raw => "raw",
            Self::Responses => "responses",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Settings of a single in-memory [`RequestCoalescingCache`](super::RequestCoalescingCache).
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Cache identifier used for metric names.
    pub name: CacheName,
    /// Capacity, as the total weight of all entries.
    ///
    /// Weights are defined by the cache's [`Decoder`](crate::decode::Decoder), usually bytes.
    pub capacity: u64,
}

impl CacheSettings {
    pub fn new(name: CacheName, capacity: u64) -> Self {
        Self { name, capacity }
    }
}
