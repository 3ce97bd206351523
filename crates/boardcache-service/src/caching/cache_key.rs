use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use super::CacheError;

/// The identity of a fetchable resource.
///
/// A key is built from a normalized URL: scheme and host are lowercased, default ports are
/// dropped and the fragment is removed, since it never reaches the server. Equality and
/// hashing only consider the SHA-256 of the normalized URL.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    url: Arc<Url>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for an already parsed [`Url`].
    ///
    /// Only `http` and `https` URLs can be fetched.
    pub fn from_url(url: &Url) -> Result<Self, CacheError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CacheError::InvalidUrl(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(CacheError::InvalidUrl(format!("missing host in `{url}`")));
        }

        let mut url = url.clone();
        url.set_fragment(None);

        let mut hash = [0; 32];
        hash.copy_from_slice(&Sha256::digest(url.as_str().as_bytes()));

        Ok(CacheKey {
            url: Arc::new(url),
            hash,
        })
    }

    /// Parses and normalizes `url` into a [`CacheKey`].
    pub fn parse(url: &str) -> Result<Self, CacheError> {
        let url = Url::parse(url).map_err(|e| CacheError::InvalidUrl(e.to_string()))?;
        Self::from_url(&url)
    }

    /// The normalized URL this key refers to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            // writing into a `String` cannot fail
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}
