use std::sync::Arc;

use boardcache_service::caching::{CacheKey, Inline};
use boardcache_service::config::Config;
use boardcache_service::decode::DecodeHints;
use boardcache_service::services::create_service;
use boardcache_service::threads::{Post, SnapshotStore};
use boardcache_test::{HitCounter, read_fixture, setup, tempdir};
use tokio::runtime::Handle;

#[test]
fn test_merge_fixtures() {
    setup();
    let dir = tempdir();
    let thread_dir = dir.path().join("g").join("1700000000");
    let store = SnapshotStore::default();

    let old: Vec<Post> =
        serde_json::from_slice(&read_fixture("threads/g-1700000000-old.json")).unwrap();
    let new: Vec<Post> =
        serde_json::from_slice(&read_fixture("threads/g-1700000000-new.json")).unwrap();

    store.update(&thread_dir, old).unwrap();
    let merged = store.update(&thread_dir, new).unwrap();

    let numbers: Vec<_> = merged.posts().iter().map(|post| post.no).collect();
    assert_eq!(numbers, [1700000000, 1700000004, 1700000011, 1700000023]);

    // the edited post replaces the saved one
    assert!(merged.posts()[1].comment.contains("USER WAS BANNED"));
    // the pruned post is still there
    assert_eq!(merged.posts()[2].comment, "this post gets pruned");
    assert_eq!(merged.posts()[3].tripcode.as_deref(), Some("!!Ferr1s"));

    let op = merged.op().unwrap();
    assert_eq!(op.images.len(), 1);
    assert_eq!(op.images[0].extension, "png");

    assert_eq!(store.load(&thread_dir).unwrap(), Some(merged));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_and_save_thread() {
    setup();
    let server = HitCounter::new();
    let dir = tempdir();
    let services =
        create_service(&Config::default(), Handle::current(), Arc::new(Inline)).unwrap();

    let key = CacheKey::from_url(&server.url("fixtures/threads/g-1700000000-new.json")).unwrap();
    let body = services
        .raw
        .fetch(key, DecodeHints::default())
        .await
        .unwrap();
    let posts: Vec<Post> = serde_json::from_slice(&body).unwrap();

    let snapshot = services.threads.update(dir.path(), posts).unwrap();
    assert_eq!(snapshot.len(), 3);
    assert!(SnapshotStore::path(dir.path()).is_file());
}
