use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::{Config, ResponseCacheConfig};

use super::{CacheKey, CacheName};

/// The interval in which cached responses should be touched.
///
/// Responses use a "time to idle" instead of "time to live" mode.
/// We thus need to regularly "touch" the files to signal that they are still in use.
/// This is being debounced to once every hour to not have to touch them on every single use.
pub(super) const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// The layout version of the `responses` directory.
///
/// Bumping this makes all previously written responses unreachable, and `cleanup` will
/// eventually remove them.
///
/// Version 2 prefixes the body with its [`ResponseMetadata`].
pub(super) const RESPONSES_VERSION: u32 = 2;

/// Freshness information and validators of a stored response.
///
/// Responses are used without asking the server as long as they are fresh. Once stale, they
/// are revalidated with a conditional request built from the validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// The `ETag` of the response, sent back as `If-None-Match`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// The `Last-Modified` date of the response, sent back as `If-Modified-Since`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// When the response was received or last revalidated.
    pub stored_at: SystemTime,
    /// For how long after `stored_at` the response may be used without revalidation.
    #[serde(default)]
    pub max_age: Duration,
}

impl ResponseMetadata {
    /// Metadata for a response received just now.
    pub fn new(max_age: Duration) -> Self {
        Self {
            etag: None,
            last_modified: None,
            stored_at: SystemTime::now(),
            max_age,
        }
    }

    /// Whether the response may still be used without asking the server.
    pub fn is_fresh(&self) -> bool {
        self.stored_at.elapsed().unwrap_or_default() < self.max_age
    }

    /// Whether a conditional request can be made for the response.
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Merges the metadata of a `304 Not Modified` answer into this one.
    pub fn revalidated(self, update: ResponseMetadata) -> Self {
        Self {
            etag: update.etag.or(self.etag),
            last_modified: update.last_modified.or(self.last_modified),
            stored_at: update.stored_at,
            max_age: update.max_age,
        }
    }
}

/// A response read from the [`ResponseCache`], fresh or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub metadata: ResponseMetadata,
    pub body: Bytes,
}

/// Persists successfully downloaded response bodies on the file system.
///
/// Only successful responses are ever written. Failed downloads are retried by the next
/// request, exactly like in the in-memory layer.
///
/// Each file holds a 4-byte big-endian length, that many bytes of JSON [`ResponseMetadata`],
/// and the response body. The file `mtime` tracks the last use for [`cleanup`](Self::cleanup),
/// while freshness is decided by the metadata alone.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    /// Directory to use for storing cache items. Will be created if it does not exist.
    pub(super) cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// New files are written to a temporary file in this sibling directory, and atomically
    /// moved to their actual location within the [`cache_dir`](Self::cache_dir) once complete.
    pub(super) tmp_dir: PathBuf,

    /// Expiration and size limits.
    pub(super) config: ResponseCacheConfig,
}

impl ResponseCache {
    /// Creates the response cache if a `cache_dir` is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match config.cache_dir.as_deref() {
            Some(base) => Self::new(base, config.caches.responses).map(Some),
            None => Ok(None),
        }
    }

    /// Creates a response cache below the `base` directory.
    pub fn new(base: &Path, config: ResponseCacheConfig) -> io::Result<Self> {
        let cache_dir = base.join(CacheName::Responses.as_ref());
        let tmp_dir = base.join("tmp");
        fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            config,
        })
    }

    pub fn name(&self) -> CacheName {
        CacheName::Responses
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path(RESPONSES_VERSION))
    }

    /// Whether a response for `key` exists on disk, fresh or not.
    ///
    /// This does not count as a use, and thus never touches the file.
    pub fn is_cached(&self, key: &CacheKey) -> bool {
        matches!(
            catch_not_found(|| self.check_expiry(&self.path_for(key))),
            Ok(Some(_))
        )
    }

    /// Loads the response for `key`, if one is stored and has not been unused for too long.
    ///
    /// The response may be stale, check [`ResponseMetadata::is_fresh`] before using it without
    /// revalidation. Takes care of bumping `mtime`.
    pub fn load(&self, key: &CacheKey) -> io::Result<Option<CachedResponse>> {
        let path = self.path_for(key);

        // `io::ErrorKind::NotFound` can be returned from multiple locations in this function.
        // All of those indicate a cache miss, as cleanup can run in between.
        catch_not_found(|| {
            let touch_in = self.check_expiry(&path)?;
            let contents = fs::read(&path)?;
            let Some(response) = parse_response(contents) else {
                tracing::warn!("Ignoring malformed cached response for `{}`", key);
                return Err(io::ErrorKind::NotFound.into());
            };

            if touch_in == Duration::ZERO {
                filetime::set_file_mtime(&path, FileTime::now())?;
            }

            metric!(counter("caches.file.hit") += 1, "cache" => self.name().as_ref());
            Ok(response)
        })
    }

    /// Persists a successfully downloaded response for `key`, replacing any previous one.
    pub fn store(&self, key: &CacheKey, metadata: &ResponseMetadata, body: &[u8]) -> io::Result<()> {
        let metadata = serde_json::to_vec(metadata).map_err(io::Error::other)?;
        let metadata_len = u32::try_from(metadata.len()).map_err(io::Error::other)?;

        let mut temp_file = self.tempfile()?;
        temp_file.write_all(&metadata_len.to_be_bytes())?;
        temp_file.write_all(&metadata)?;
        temp_file.write_all(body)?;
        temp_file.flush()?;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        temp_file.persist(&path).map_err(|e| e.error)?;

        tracing::trace!("Stored response for `{}` at `{}`", key, path.display());
        metric!(counter("caches.file.write") += 1, "cache" => self.name().as_ref());
        metric!(time_raw("caches.file.size") = body.len() as u64, "cache" => self.name().as_ref());

        Ok(())
    }

    /// Removes the response for `key`, if there is one.
    pub fn remove(&self, key: &CacheKey) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(self.path_for(key)))?;
        Ok(())
    }

    /// Validates the expiration of the file at `path`.
    ///
    /// Returns `Err(io::ErrorKind::NotFound)` if the file should not be used anymore, or
    /// the time after which the file should be touched again.
    pub(super) fn check_expiry(&self, path: &Path) -> io::Result<Duration> {
        // We use `mtime` to keep track of "last used", because literally every other
        // filesystem attribute is unreliable.
        let metadata = path.metadata()?;
        if !metadata.is_file() {
            return Err(io::ErrorKind::NotFound.into());
        }
        self.check_mtime(metadata.modified()?)
    }

    pub(super) fn check_mtime(&self, mtime: SystemTime) -> io::Result<Duration> {
        let mtime_elapsed = mtime.elapsed().unwrap_or_default();
        let max_unused_for = self.config.max_unused_for.unwrap_or(Duration::MAX);

        if mtime_elapsed > max_unused_for {
            return Err(io::ErrorKind::NotFound.into());
        }

        Ok(TOUCH_EVERY.saturating_sub(mtime_elapsed))
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so be defensive here and retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let path = &self.tmp_dir;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Splits a stored file into its metadata and body.
pub(super) fn parse_response(contents: Vec<u8>) -> Option<CachedResponse> {
    let prefix = contents.get(..4)?;
    let metadata_len = u32::from_be_bytes(prefix.try_into().ok()?) as usize;
    let metadata_end = 4usize.checked_add(metadata_len)?;
    let metadata = serde_json::from_slice(contents.get(4..metadata_end)?).ok()?;

    let body = Bytes::from(contents).slice(metadata_end..);
    Some(CachedResponse { metadata, body })
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
