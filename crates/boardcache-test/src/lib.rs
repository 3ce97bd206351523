//! Helpers for testing the transport and the caches against a real HTTP server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    cache still writes to it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to the
//!    server have been made. If the server is dropped, all connections to it fail.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use image::{ImageFormat, Rgba, RgbaImage};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `boardcache` crates and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("boardcache_service=trace,boardcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns the absolute path to the given fixture.
///
/// Fixtures are located in the `tests/fixtures` directory, located from the workspace root.
///
/// # Panics
///
/// Panics if the fixture path does not exist on the file system.
pub fn fixture(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let full_path = fixtures_dir().join(path);
    assert!(full_path.exists(), "'{}' does not exist", path.display());
    full_path
}

fn fixtures_dir() -> PathBuf {
    let mut full_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    full_path.pop(); // to /crates/
    full_path.pop(); // to /
    full_path.push("tests/fixtures");
    full_path
}

/// Returns the contents of a fixture.
///
/// # Panics
///
/// Panics if the fixture does not exist or cannot be read.
pub fn read_fixture(path: impl AsRef<Path>) -> Vec<u8> {
    std::fs::read(fixture(path)).unwrap()
}

/// Encodes a solid-colored PNG of the given dimensions.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba([0x78, 0x99, 0xbb, 0xff]));
    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Png).unwrap();
    cursor.into_inner()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given [`Router`].
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

async fn count_hits(
    State(hits): State<Hits>,
    OriginalUri(uri): OriginalUri,
    request: Request,
    next: Next,
) -> Response {
    {
        let mut hits = hits.lock().unwrap();
        let hits = hits.entry(uri.to_string()).or_default();
        *hits += 1;
    }
    next.run(request).await
}

/// A server that counts how often each path was requested.
///
/// Routes:
///
///  - `/delay/<duration>/<path>` redirects to `/<path>` after sleeping for `<duration>`.
///  - `/respond_statuscode/<num>/<tail>` responds with status code `<num>`.
///  - `/garbage_data/<tail>` responds with `<tail>` as the body, cacheable for an hour.
///  - `/png/<width>/<height>` responds with a PNG image of the given size, cacheable for an hour.
///  - `/revision/<tail>` responds with the current [revision](HitCounter::set_revision) and no
///    caching headers.
///  - `/etag/<tail>` responds with the current revision, tagged with an `ETag` that must be
///    revalidated on every use. Answers `304 Not Modified` if `If-None-Match` matches.
///  - `/no_store/<tail>` responds with `<tail>` as the body, which must not be stored.
///  - `/fixtures/<path>` responds with the contents of a fixture.
///  - `/echo_headers` responds with the `User-Agent` and `Referer` of the request.
pub struct HitCounter {
    server: Server,
    hits: Hits,
    revision: Arc<AtomicUsize>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Hits::default();
        let revision = Arc::new(AtomicUsize::new(1));
        let current = revision.clone();
        let tagged = revision.clone();

        let router = Router::new()
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move {
                    ([(header::CACHE_CONTROL, "max-age=3600")], tail)
                }),
            )
            .route(
                "/png/:width/:height",
                get(
                    |extract::Path((width, height)): extract::Path<(u32, u32)>| async move {
                        let headers = [
                            (header::CONTENT_TYPE, "image/png"),
                            (header::CACHE_CONTROL, "max-age=3600"),
                        ];
                        (headers, png(width, height))
                    },
                ),
            )
            .route(
                "/revision/*tail",
                get(move || async move {
                    format!("{{\"revision\":{}}}", current.load(Ordering::SeqCst))
                }),
            )
            .route(
                "/etag/*tail",
                get(move |headers: HeaderMap| async move {
                    let revision = tagged.load(Ordering::SeqCst);
                    let etag = format!("\"{revision}\"");
                    let matches = headers
                        .get(header::IF_NONE_MATCH)
                        .is_some_and(|value| value.as_bytes() == etag.as_bytes());
                    let headers = [
                        (header::ETAG, etag),
                        (header::CACHE_CONTROL, "no-cache".to_owned()),
                    ];
                    if matches {
                        (StatusCode::NOT_MODIFIED, headers).into_response()
                    } else {
                        (headers, format!("{{\"revision\":{revision}}}")).into_response()
                    }
                }),
            )
            .route(
                "/no_store/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move {
                    ([(header::CACHE_CONTROL, "no-store")], tail)
                }),
            )
            .route(
                "/fixtures/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    match tokio::fs::read(fixtures_dir().join(path)).await {
                        Ok(contents) => contents.into_response(),
                        Err(_) => StatusCode::NOT_FOUND.into_response(),
                    }
                }),
            )
            .route(
                "/echo_headers",
                get(|headers: HeaderMap| async move {
                    let get = |name: header::HeaderName| {
                        headers
                            .get(name)
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default()
                            .to_owned()
                    };
                    format!("{}\n{}", get(header::USER_AGENT), get(header::REFERER))
                }),
            )
            .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

        let server = Server::with_router(router);
        Self {
            server,
            hits,
            revision,
        }
    }

    /// Changes the body served by the `/revision` and `/etag` routes.
    pub fn set_revision(&self, revision: usize) {
        self.revision.store(revision, Ordering::SeqCst);
    }

    /// Returns the total number of hits since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the hits per path since the last call, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
