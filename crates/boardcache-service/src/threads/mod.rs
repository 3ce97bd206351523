//! Saved threads.
//!
//! A saved thread is a snapshot of all posts seen so far. Every refresh merges the freshly
//! fetched posts into the previous snapshot, so posts that were pruned remotely survive in the
//! saved copy, while edited posts (for example after a ban message was appended) are updated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod store;

pub use store::{MAX_THREAD_SIZE, SnapshotError, SnapshotStore, THREAD_FILE_NAME};

/// A file attached to a [`Post`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostImage {
    /// The name under which the server stores the file, usually a timestamp.
    pub server_filename: String,
    /// The original name of the file, without extension.
    pub filename: String,
    pub extension: String,
    pub width: u32,
    pub height: u32,
    /// File size in bytes.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub spoiler: bool,
}

/// A single post of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// The post number, assigned in ascending order by the board.
    pub no: u64,
    /// The number of the thread this post replies to, `0` for the opening post.
    #[serde(default)]
    pub resto: u64,
    /// Unix timestamp of the post.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// The post body as HTML.
    #[serde(default)]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<PostImage>,
}

impl Post {
    pub fn is_op(&self) -> bool {
        self.resto == 0
    }
}

/// All posts of a thread, ordered by ascending [`Post::no`] without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    posts: Vec<Post>,
}

impl ThreadSnapshot {
    /// Creates a snapshot from posts in any order.
    ///
    /// If a post number appears more than once, the last one wins.
    pub fn from_posts(posts: Vec<Post>) -> Self {
        Self {
            posts: merge(Vec::new(), posts),
        }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn into_posts(self) -> Vec<Post> {
        self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    /// The opening post, if it is part of the snapshot.
    pub fn op(&self) -> Option<&Post> {
        self.posts.first().filter(|post| post.is_op())
    }

    /// Merges freshly fetched `posts` into this snapshot, see [`merge`].
    pub fn merge(&self, posts: Vec<Post>) -> Self {
        Self {
            posts: merge(self.posts.clone(), posts),
        }
    }
}

/// Reconciles a previously saved sequence of posts with a freshly fetched one.
///
/// The result contains every post number of either input exactly once, in ascending order.
/// When a post number appears in both, the post from `new` wins. Merging the result with the
/// same `new` posts again yields the same result.
pub fn merge(old: Vec<Post>, new: Vec<Post>) -> Vec<Post> {
    let mut merged = BTreeMap::new();
    for post in old.into_iter().chain(new) {
        merged.insert(post.no, post);
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(no: u64, comment: &str) -> Post {
        Post {
            no,
            resto: if no == 1 { 0 } else { 1 },
            time: 1_700_000_000 + no as i64,
            name: Some("Anonymous".into()),
            tripcode: None,
            subject: None,
            comment: comment.into(),
            images: Vec::new(),
        }
    }

    fn numbers(posts: &[Post]) -> Vec<u64> {
        posts.iter().map(|post| post.no).collect()
    }

    #[test]
    fn test_new_content_wins() {
        let merged = merge(vec![post(1, "a")], vec![post(1, "b"), post(2, "c")]);
        assert_eq!(merged, vec![post(1, "b"), post(2, "c")]);
    }

    #[test]
    fn test_pruned_posts_survive() {
        let old = vec![post(1, "op"), post(2, "pruned"), post(3, "kept")];
        let new = vec![post(1, "op"), post(3, "kept"), post(4, "fresh")];

        let merged = merge(old, new);
        assert_eq!(numbers(&merged), [1, 2, 3, 4]);
        assert_eq!(merged[1].comment, "pruned");
    }

    #[test]
    fn test_ascending_order() {
        let old = vec![post(7, "g"), post(3, "c")];
        let new = vec![post(5, "e"), post(1, "a"), post(3, "c2")];

        let merged = merge(old, new);
        assert_eq!(numbers(&merged), [1, 3, 5, 7]);
        assert_eq!(merged[1].comment, "c2");
    }

    #[test]
    fn test_idempotent() {
        let old = vec![post(1, "a"), post(2, "b"), post(4, "d")];
        let new = vec![post(2, "b2"), post(3, "c")];

        let once = merge(old, new.clone());
        let twice = merge(once.clone(), new);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(merge(Vec::new(), Vec::new()).is_empty());
        assert_eq!(numbers(&merge(vec![post(2, "b")], Vec::new())), [2]);
        assert_eq!(numbers(&merge(Vec::new(), vec![post(2, "b")])), [2]);
    }

    #[test]
    fn test_snapshot() {
        let snapshot = ThreadSnapshot::from_posts(vec![post(2, "b"), post(1, "a"), post(2, "b2")]);
        assert_eq!(numbers(snapshot.posts()), [1, 2]);
        assert_eq!(snapshot.posts()[1].comment, "b2");
        assert_eq!(snapshot.op().map(|op| op.no), Some(1));

        let merged = snapshot.merge(vec![post(3, "c")]);
        assert_eq!(merged.len(), 3);
        assert_eq!(snapshot.len(), 2);

        let replies_only = ThreadSnapshot::from_posts(vec![post(5, "e")]);
        assert_eq!(replies_only.op(), None);
    }
}
