use std::sync::Arc;
use std::time::Duration;

use boardcache_service::caching::{CacheError, CacheKey};
use boardcache_service::config::Config;
use boardcache_service::download::{HttpTransport, Progress, ProgressReporter, Transport};
use boardcache_test as test;
use parking_lot::Mutex;

fn transport(config: &Config) -> HttpTransport {
    HttpTransport::from_config(config).unwrap()
}

async fn fetch(transport: &HttpTransport, key: &CacheKey) -> Result<String, CacheError> {
    let body = transport.fetch(key, &ProgressReporter::noop()).await?;
    Ok(String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_download() {
    test::setup();
    let server = test::HitCounter::new();
    let transport = transport(&Config::default());

    let key = CacheKey::from_url(&server.url("garbage_data/hello")).unwrap();
    assert_eq!(fetch(&transport, &key).await.unwrap(), "hello");
    assert_eq!(fetch(&transport, &key).await.unwrap(), "hello");

    // without a cache dir, every fetch goes to the network
    assert_eq!(server.accesses(), 2);
    assert!(!transport.is_cached(&key));
}

#[tokio::test]
async fn test_download_progress() {
    test::setup();
    let server = test::HitCounter::new();
    let transport = transport(&Config::default());

    let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let sink = Arc::clone(&seen);
    let reporter = ProgressReporter::new(move |progress| sink.lock().push(progress));

    let key = CacheKey::from_url(&server.url("png/32/32")).unwrap();
    let body = transport.fetch(&key, &reporter).await.unwrap();
    let len = body.len() as u64;

    let seen = seen.lock();
    assert_eq!(seen.first().map(|p| p.downloaded), Some(0));
    assert_eq!(
        seen.last().copied(),
        Some(Progress {
            downloaded: len,
            total: Some(len),
        })
    );
    assert!(seen.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
}

#[tokio::test]
async fn test_status_codes() {
    test::setup();
    let server = test::HitCounter::new();
    let transport = transport(&Config::default());

    let key = CacheKey::from_url(&server.url("respond_statuscode/404/g/thread/1.json")).unwrap();
    assert_eq!(fetch(&transport, &key).await, Err(CacheError::NotFound));

    let key = CacheKey::from_url(&server.url("respond_statuscode/403/g/thread/1.json")).unwrap();
    assert_eq!(
        fetch(&transport, &key).await,
        Err(CacheError::PermissionDenied("403 Forbidden".into()))
    );

    let key = CacheKey::from_url(&server.url("respond_statuscode/500/g/thread/1.json")).unwrap();
    assert_eq!(
        fetch(&transport, &key).await,
        Err(CacheError::DownloadError("500 Internal Server Error".into()))
    );

    let key = CacheKey::from_url(&server.url("fixtures/threads/does-not-exist.json")).unwrap();
    assert_eq!(fetch(&transport, &key).await, Err(CacheError::NotFound));
}

#[tokio::test]
async fn test_request_headers() {
    test::setup();
    let server = test::HitCounter::new();
    let config = Config {
        user_agent: Some("Clover/3.0".into()),
        ..Default::default()
    };
    let transport = transport(&config);

    let url = server.url("echo_headers");
    let key = CacheKey::from_url(&url).unwrap();
    let body = fetch(&transport, &key).await.unwrap();
    assert_eq!(body, format!("Clover/3.0\n{url}"));
}

#[tokio::test]
async fn test_timeout() {
    test::setup();
    let server = test::HitCounter::new();
    let config = Config {
        max_download_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let transport = transport(&config);

    let key = CacheKey::from_url(&server.url("delay/1s/garbage_data/slow")).unwrap();
    assert_eq!(
        fetch(&transport, &key).await,
        Err(CacheError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn test_timeout_conversion() {
    test::setup();
    let server = test::HitCounter::new();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let err = client
        .get(server.url("delay/1s/garbage_data/slow"))
        .send()
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // without knowing the configured timeout, no bogus duration is reported
    let err = CacheError::from(err);
    assert!(matches!(err, CacheError::DownloadError(_)), "{err:?}");
}

#[tokio::test]
async fn test_connection_refused() {
    test::setup();
    let transport = transport(&Config::default());

    // nothing listens on a port that was just released
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let key = CacheKey::parse(&format!("http://127.0.0.1:{port}/g/catalog.json")).unwrap();
    let result = fetch(&transport, &key).await;
    assert!(matches!(result, Err(CacheError::DownloadError(_))), "{result:?}");
}

#[tokio::test]
async fn test_response_cache() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let transport = transport(&config);

    let key = CacheKey::from_url(&server.url("garbage_data/cached")).unwrap();
    assert!(!transport.is_cached(&key));
    assert_eq!(fetch(&transport, &key).await.unwrap(), "cached");
    assert!(transport.is_cached(&key));
    assert_eq!(server.accesses(), 1);

    // a fresh transport on the same cache dir serves from disk
    let transport = self::transport(&config);
    assert_eq!(fetch(&transport, &key).await.unwrap(), "cached");
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_response_cache_refetches_changed_response() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let transport = transport(&config);

    let key = CacheKey::from_url(&server.url("revision/g/thread/1.json")).unwrap();
    assert_eq!(fetch(&transport, &key).await.unwrap(), r#"{"revision":1}"#);
    assert!(transport.is_cached(&key));

    // without `max-age` and validators, the stored response is downloaded again
    server.set_revision(2);
    assert_eq!(fetch(&transport, &key).await.unwrap(), r#"{"revision":2}"#);
    assert_eq!(server.accesses(), 2);

    let transport = self::transport(&config);
    server.set_revision(3);
    assert_eq!(fetch(&transport, &key).await.unwrap(), r#"{"revision":3}"#);
}

#[tokio::test]
async fn test_response_cache_revalidation() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let transport = transport(&config);

    let key = CacheKey::from_url(&server.url("etag/g/thread/2.json")).unwrap();
    assert_eq!(fetch(&transport, &key).await.unwrap(), r#"{"revision":1}"#);

    // answered with `304 Not Modified`, the stored body is used
    let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let sink = Arc::clone(&seen);
    let reporter = ProgressReporter::new(move |progress| sink.lock().push(progress));
    let body = transport.fetch(&key, &reporter).await.unwrap();
    assert_eq!(&body[..], br#"{"revision":1}"#);
    assert_eq!(
        seen.lock().last().copied(),
        Some(Progress {
            downloaded: body.len() as u64,
            total: Some(body.len() as u64),
        })
    );
    assert_eq!(server.accesses(), 2);

    server.set_revision(2);
    assert_eq!(fetch(&transport, &key).await.unwrap(), r#"{"revision":2}"#);
    assert_eq!(fetch(&transport, &key).await.unwrap(), r#"{"revision":2}"#);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_no_store_is_not_cached() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let transport = transport(&config);

    let key = CacheKey::from_url(&server.url("no_store/g/catalog.json")).unwrap();
    assert_eq!(fetch(&transport, &key).await.unwrap(), "g/catalog.json");
    assert!(!transport.is_cached(&key));
    assert_eq!(fetch(&transport, &key).await.unwrap(), "g/catalog.json");
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_errors_are_not_cached_on_disk() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let transport = transport(&config);

    let key = CacheKey::from_url(&server.url("respond_statuscode/500/g/catalog.json")).unwrap();
    assert!(fetch(&transport, &key).await.is_err());
    assert!(fetch(&transport, &key).await.is_err());
    assert!(!transport.is_cached(&key));
    assert_eq!(server.accesses(), 2);
}
