//! The implementation of the `fetch` and `merge-thread` commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use boardcache_service::caching::{CacheKey, RuntimeDispatch};
use boardcache_service::config::Config;
use boardcache_service::decode::DecodeHints;
use boardcache_service::services::{BoardServices, create_service};
use boardcache_service::threads::{Post, ThreadSnapshot};
use clap::Args;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::runtime::Runtime;

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// The URLs to fetch.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Downscale images to fit this width. `0` leaves the width unconstrained.
    #[arg(long, default_value_t = 0)]
    pub width: u32,

    /// Downscale images to fit this height. `0` leaves the height unconstrained.
    #[arg(long, default_value_t = 0)]
    pub height: u32,

    /// Keep the response bodies as they are instead of decoding images.
    #[arg(long)]
    pub raw: bool,
}

#[derive(Debug, Args)]
pub struct MergeThreadArgs {
    /// The directory holding the thread snapshot.
    pub thread_dir: PathBuf,

    /// A JSON file or `http(s)` URL with the current posts of the thread.
    ///
    /// Accepts both a plain list of posts and an object with a `posts` list.
    pub posts: String,
}

fn create_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("boardcache-io")
        .enable_all()
        .build()
        .context("failed to create runtime")
}

fn create_services(config: &Config, runtime: &Runtime) -> Result<BoardServices> {
    let handle = runtime.handle().to_owned();
    let dispatch = Arc::new(RuntimeDispatch::new(handle.clone()));
    create_service(config, handle, dispatch)
}

async fn fetch_one(services: &BoardServices, url: &str, hints: DecodeHints, raw: bool) -> Value {
    let key = match CacheKey::parse(url) {
        Ok(key) => key,
        Err(err) => return json!({ "url": url, "error": err.to_string(), "kind": err.kind() }),
    };

    let result = if raw {
        services
            .raw
            .fetch(key, hints)
            .await
            .map(|body| json!({ "url": url, "bytes": body.len() }))
    } else {
        services.images.fetch(key, hints).await.map(|bitmap| {
            json!({
                "url": url,
                "width": bitmap.width(),
                "height": bitmap.height(),
                "bytes": bitmap.byte_count(),
            })
        })
    };

    result.unwrap_or_else(|err| json!({ "url": url, "error": err.to_string(), "kind": err.kind() }))
}

/// Fetches all URLs concurrently and prints one JSON line per URL.
pub fn fetch(config: Config, args: FetchArgs) -> Result<()> {
    let runtime = create_runtime()?;
    let services = create_services(&config, &runtime)?;
    let hints = DecodeHints::new(args.width, args.height);

    let results = runtime.block_on(join_all(
        args.urls
            .iter()
            .map(|url| fetch_one(&services, url, hints, args.raw)),
    ));

    let mut failed = 0;
    for result in &results {
        if result.get("error").is_some() {
            failed += 1;
        }
        println!("{result}");
    }

    let stats = if args.raw {
        services.raw.stats()
    } else {
        services.images.stats()
    };
    tracing::debug!(?stats, "Finished fetching");

    if failed > 0 {
        bail!("{} of {} fetches failed", failed, results.len());
    }
    Ok(())
}

/// Parses either a list of posts or an object with a `posts` list.
fn parse_posts(json: &[u8]) -> Result<Vec<Post>> {
    if let Ok(posts) = serde_json::from_slice::<Vec<Post>>(json) {
        return Ok(posts);
    }
    let thread: ThreadSnapshot = serde_json::from_slice(json).context("failed to parse posts")?;
    Ok(thread.into_posts())
}

/// Merges the posts into the thread snapshot and saves it.
pub fn merge_thread(config: Config, args: MergeThreadArgs) -> Result<()> {
    let json = if args.posts.starts_with("http://") || args.posts.starts_with("https://") {
        let key = CacheKey::parse(&args.posts)?;
        let runtime = create_runtime()?;
        let services = create_services(&config, &runtime)?;
        let body = runtime.block_on(services.raw.fetch(key, DecodeHints::default()))?;
        body.to_vec()
    } else {
        std::fs::read(&args.posts)
            .with_context(|| format!("failed to read posts from `{}`", args.posts))?
    };

    let posts = parse_posts(&json)?;
    let received = posts.len();
    let store = boardcache_service::threads::SnapshotStore::default();
    let snapshot = store.update(&args.thread_dir, posts)?;

    tracing::info!(
        received,
        total = snapshot.len(),
        "Merged thread into `{}`",
        args.thread_dir.display()
    );
    println!(
        "{}",
        json!({ "thread_dir": args.thread_dir, "received": received, "posts": snapshot.len() })
    );
    Ok(())
}
