use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use reqwest::header::{self, HeaderMap};
use reqwest::{RequestBuilder, StatusCode};

use crate::caching::{
    CacheEntry, CacheError, CacheKey, CachedResponse, ResponseCache, ResponseMetadata,
};
use crate::config::Config;

use super::{Progress, ProgressReporter, Transport};

/// Upper bound for preallocating a response body based on its `Content-Length`.
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// Various timeouts for all downloads.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and download timeouts.
/// * `user_agent` is sent along with every request.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    user_agent: &str,
) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(user_agent)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// The outcome of a (possibly conditional) download.
enum Downloaded {
    /// A full response body.
    ///
    /// `metadata` is `None` if the response must not be stored.
    Body {
        body: Bytes,
        metadata: Option<ResponseMetadata>,
    },
    /// The server confirmed that the stored response is still valid.
    NotModified { metadata: Option<ResponseMetadata> },
}

/// Downloads resources over HTTP(S), optionally persisting response bodies in a
/// [`ResponseCache`].
///
/// Stored responses are served as long as they are fresh according to their `Cache-Control`
/// header. Stale responses are revalidated with `If-None-Match` and `If-Modified-Since`, or
/// downloaded again if they carry no validators.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
    responses: Option<ResponseCache>,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        timeouts: DownloadTimeouts,
        responses: Option<ResponseCache>,
    ) -> Self {
        Self {
            client,
            timeouts,
            responses,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client =
            create_client(&timeouts, &config.user_agent()).context("failed to create HTTP client")?;
        let responses =
            ResponseCache::from_config(config).context("failed to create response cache")?;

        Ok(Self::new(client, timeouts, responses))
    }

    /// The on-disk cache below this transport, if one is configured.
    pub fn responses(&self) -> Option<&ResponseCache> {
        self.responses.as_ref()
    }

    /// Whether a response for `key` is stored on disk. It may still need revalidation.
    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.responses
            .as_ref()
            .is_some_and(|responses| responses.is_cached(key))
    }

    async fn fetch_cached(&self, key: &CacheKey, progress: &ProgressReporter) -> CacheEntry<Bytes> {
        let Some(responses) = &self.responses else {
            return match self.download(key, None, progress).await? {
                Downloaded::Body { body, .. } => Ok(body),
                Downloaded::NotModified { .. } => Err(unexpected_not_modified()),
            };
        };

        let cache = responses.clone();
        let cache_key = key.clone();
        let loaded = tokio::task::spawn_blocking(move || cache.load(&cache_key))
            .await
            .map_err(CacheError::from_std_error)?;
        let cached = match loaded {
            Ok(cached) => cached,
            Err(err) => {
                let err = &err as &dyn std::error::Error;
                tracing::error!(error = err, "Failed to read cached response");
                None
            }
        };

        if let Some(cached) = &cached {
            if cached.metadata.is_fresh() {
                tracing::trace!("Serving `{}` from the response cache", key);
                report_complete(progress, &cached.body);
                return Ok(cached.body.clone());
            }
        }

        let validators = cached
            .as_ref()
            .map(|cached| &cached.metadata)
            .filter(|metadata| metadata.has_validators());

        match self.download(key, validators, progress).await? {
            Downloaded::Body { body, metadata } => {
                self.persist(responses, key, metadata, body.clone()).await;
                Ok(body)
            }
            Downloaded::NotModified { metadata } => {
                let Some(CachedResponse {
                    metadata: stored,
                    body,
                }) = cached
                else {
                    return Err(unexpected_not_modified());
                };
                tracing::trace!("Revalidated `{}` in the response cache", key);
                metric!(counter("download.not_modified") += 1);

                report_complete(progress, &body);
                let metadata = metadata.map(|update| stored.revalidated(update));
                self.persist(responses, key, metadata, body.clone()).await;
                Ok(body)
            }
        }
    }

    /// Stores `body` with its `metadata`, or removes the stored response if it may not be kept.
    async fn persist(
        &self,
        responses: &ResponseCache,
        key: &CacheKey,
        metadata: Option<ResponseMetadata>,
        body: Bytes,
    ) {
        let cache = responses.clone();
        let cache_key = key.clone();
        let result = tokio::task::spawn_blocking(move || match metadata {
            Some(metadata) => cache.store(&cache_key, &metadata, &body),
            None => cache.remove(&cache_key),
        })
        .await;

        if let Ok(Err(err)) = result {
            let err = &err as &dyn std::error::Error;
            tracing::error!(error = err, "Failed to store response");
        }
    }

    async fn download(
        &self,
        key: &CacheKey,
        validators: Option<&ResponseMetadata>,
        progress: &ProgressReporter,
    ) -> CacheEntry<Downloaded> {
        let url = key.url();
        let start = Instant::now();
        tracing::debug!("Fetching `{}`", url);

        let request = self
            .client
            .get(url.clone())
            .header(header::REFERER, url.as_str());
        let mut response = conditional(request, validators)
            .send()
            .await
            .map_err(|err| self.map_error(err))?;

        let status = response.status();
        metric!(counter("download.status") += 1, "status" => status.as_str());
        if status == StatusCode::NOT_MODIFIED && validators.is_some() {
            return Ok(Downloaded::NotModified {
                metadata: cache_policy(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(error_for_status(key, status));
        }

        let metadata = cache_policy(response.headers());
        let total = response.content_length();
        let capacity = total.unwrap_or(0).min(MAX_PREALLOC) as usize;
        let mut body = BytesMut::with_capacity(capacity);
        progress.report(Progress {
            downloaded: 0,
            total,
        });

        while let Some(chunk) = response.chunk().await.map_err(|err| self.map_error(err))? {
            body.extend_from_slice(&chunk);
            progress.report(Progress {
                downloaded: body.len() as u64,
                total,
            });
        }

        if let Some(total) = total {
            if (body.len() as u64) < total {
                return Err(CacheError::DownloadError(format!(
                    "incomplete body: received {} of {} bytes",
                    body.len(),
                    total
                )));
            }
        }

        metric!(timer("download.duration") = start.elapsed());
        metric!(time_raw("download.size") = body.len() as u64);
        Ok(Downloaded::Body {
            body: body.freeze(),
            metadata,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> CacheError {
        if err.is_timeout() {
            CacheError::Timeout(self.timeouts.max_download)
        } else {
            err.into()
        }
    }
}

impl Transport for HttpTransport {
    fn fetch<'a>(
        &'a self,
        key: &'a CacheKey,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, CacheEntry<Bytes>> {
        Box::pin(self.fetch_cached(key, progress))
    }
}

/// Adds the conditional request headers for a stored response.
fn conditional(request: RequestBuilder, validators: Option<&ResponseMetadata>) -> RequestBuilder {
    let Some(validators) = validators else {
        return request;
    };
    let mut request = request;
    if let Some(etag) = &validators.etag {
        request = request.header(header::IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = &validators.last_modified {
        request = request.header(header::IF_MODIFIED_SINCE, last_modified);
    }
    request
}

/// Derives how a response may be cached from its headers.
///
/// Returns `None` for `no-store` responses. Responses without an explicit `max-age` are stale
/// right away, and thus revalidated on every fetch that misses the in-memory layer.
fn cache_policy(headers: &HeaderMap) -> Option<ResponseMetadata> {
    let mut max_age: Option<u64> = None;
    let mut no_cache = false;

    let directives = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','));
    for directive in directives {
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (directive.trim(), None),
        };

        if name.eq_ignore_ascii_case("no-store") {
            return None;
        } else if name.eq_ignore_ascii_case("no-cache") {
            no_cache = true;
        } else if name.eq_ignore_ascii_case("max-age") {
            // the first valid `max-age` wins
            if max_age.is_none() {
                max_age = value.and_then(|secs| secs.parse().ok());
            }
        }
    }

    let max_age = match max_age {
        Some(secs) if !no_cache => Duration::from_secs(secs),
        _ => Duration::ZERO,
    };
    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };

    let mut metadata = ResponseMetadata::new(max_age);
    metadata.etag = header_value(header::ETAG);
    metadata.last_modified = header_value(header::LAST_MODIFIED);
    Some(metadata)
}

fn report_complete(progress: &ProgressReporter, body: &Bytes) {
    let len = body.len() as u64;
    progress.report(Progress {
        downloaded: len,
        total: Some(len),
    });
}

fn unexpected_not_modified() -> CacheError {
    CacheError::DownloadError(StatusCode::NOT_MODIFIED.to_string())
}

fn error_for_status(key: &CacheKey, status: StatusCode) -> CacheError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{key}`: {status}");
        CacheError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404, most likely a pruned thread.
        tracing::debug!("Unexpected client error status code from `{key}`: {status}");
        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{key}`: {status}");
        CacheError::DownloadError(status.to_string())
    }
}
