//! Request-coalescing media and thread caches for imageboard clients.
//!
//! The heart of this crate is [`caching::RequestCoalescingCache`], which deduplicates concurrent
//! fetches of the same URL, keeps decoded payloads in a weighted in-memory LRU and fans out every
//! outcome to all interested listeners. Around it live the collaborators it talks to: the
//! [`download`] transport with its on-disk response cache, the [`decode`] pipelines, and the
//! [`threads`] snapshot merge and persistence.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decode;
pub mod download;
pub mod logging;
pub mod services;
pub mod threads;
pub mod utils;
