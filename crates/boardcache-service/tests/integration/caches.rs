use std::sync::Arc;

use boardcache_service::caching::{CacheError, CacheKey, RuntimeDispatch};
use boardcache_service::config::Config;
use boardcache_service::decode::DecodeHints;
use boardcache_service::services::{BoardServices, create_service};
use boardcache_test as test;
use tokio::runtime::Handle;

fn services(config: &Config) -> BoardServices {
    create_service(config, Handle::current(), Arc::new(RuntimeDispatch::current())).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_thumbnail() {
    test::setup();
    let server = test::HitCounter::new();
    let services = services(&Config::default());

    let key = CacheKey::from_url(&server.url("png/64/32")).unwrap();
    let bitmap = services
        .images
        .fetch(key.clone(), DecodeHints::new(16, 16))
        .await
        .unwrap();
    assert_eq!((bitmap.width(), bitmap.height()), (16, 8));

    // the second request is served from memory
    let cached = services
        .images
        .fetch(key.clone(), DecodeHints::default())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&bitmap, &cached));
    assert_eq!(server.accesses(), 1);

    let stats = services.images.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.weight, 16 * 8 * 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_coalescing_over_http() {
    test::setup();
    let server = test::HitCounter::new();
    let services = services(&Config::default());

    let key = CacheKey::from_url(&server.url("delay/100ms/png/40/40")).unwrap();
    let fetches = (0..8).map(|_| {
        let images = services.images.clone();
        let key = key.clone();
        tokio::spawn(async move { images.fetch(key, DecodeHints::default()).await })
    });

    for result in futures::future::join_all(fetches).await {
        let bitmap = result.unwrap().unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (40, 40));
    }

    let hits = server.all_hits();
    assert_eq!(
        hits,
        [
            ("/delay/100ms/png/40/40".to_owned(), 1),
            ("/png/40/40".to_owned(), 1),
        ]
    );
    assert_eq!(services.images.stats().computations, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_image_is_not_cached() {
    test::setup();
    let server = test::HitCounter::new();
    let services = services(&Config::default());

    let key = CacheKey::from_url(&server.url("garbage_data/not-an-image")).unwrap();
    let result = services.images.fetch(key.clone(), DecodeHints::default()).await;
    assert!(matches!(result, Err(CacheError::Malformed(_))), "{result:?}");

    assert!(services.images.get_cached(&key).is_none());
    let result = services.images.fetch(key, DecodeHints::default()).await;
    assert!(result.is_err());
    assert_eq!(server.accesses(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disk_cache_below_memory() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let services = services(&config);

    let key = CacheKey::from_url(&server.url("png/8/8")).unwrap();
    services
        .images
        .fetch(key.clone(), DecodeHints::default())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);

    // dropping the decoded image forces a decode, but not a download
    services.images.evict_all();
    assert!(services.images.get_cached(&key).is_none());
    let bitmap = services
        .images
        .fetch(key, DecodeHints::default())
        .await
        .unwrap();
    assert_eq!(bitmap.width(), 8);
    assert_eq!(server.accesses(), 0);
    assert_eq!(services.images.stats().computations, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disk_cache_serves_updated_thread() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_path_buf()),
        ..Default::default()
    };
    let services = services(&config);

    let key = CacheKey::from_url(&server.url("etag/g/thread/1700000000.json")).unwrap();
    let body = services
        .raw
        .fetch(key.clone(), DecodeHints::default())
        .await
        .unwrap();
    assert_eq!(&body[..], br#"{"revision":1}"#);

    // new replies arrive, and the next refresh must not see the stored body
    server.set_revision(2);
    services.raw.evict_all();
    let body = services
        .raw
        .fetch(key, DecodeHints::default())
        .await
        .unwrap();
    assert_eq!(&body[..], br#"{"revision":2}"#);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_over_http() {
    test::setup();
    let server = test::HitCounter::new();
    let services = services(&Config::default());

    let key = CacheKey::from_url(&server.url("delay/200ms/garbage_data/late")).unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = services
        .raw
        .request(key.clone(), DecodeHints::default(), move |result| {
            tx.send(result).ok();
        });
    assert!(services.raw.is_pending(&key));

    assert!(services.raw.cancel(&handle));
    assert!(!services.raw.is_pending(&key));
    // cancelling twice is a no-op
    assert!(!services.raw.cancel(&handle));

    // the listener is dropped without ever being called
    assert!(rx.recv().await.is_none());
    assert_eq!(services.raw.stats().cancelled, 1);
}
