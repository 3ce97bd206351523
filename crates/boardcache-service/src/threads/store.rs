use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{Post, ThreadSnapshot};

/// The name of the snapshot file inside a thread directory.
pub const THREAD_FILE_NAME: &str = "thread.json";

/// The maximum size of a serialized snapshot.
///
/// Infinite and sticky threads easily grow beyond this, and are not supported.
pub const MAX_THREAD_SIZE: u32 = 50 * 1024 * 1024;

/// An error reading or writing a [`ThreadSnapshot`].
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access thread snapshot")]
    Io(#[from] io::Error),
    /// The length prefix is zero or exceeds [`MAX_THREAD_SIZE`].
    #[error("invalid thread snapshot size: {0} bytes")]
    InvalidSize(u64),
    #[error("thread snapshot is truncated")]
    Truncated,
    #[error("malformed thread snapshot")]
    Malformed(#[from] serde_json::Error),
}

/// Reads and writes thread snapshots.
///
/// A snapshot is stored as `thread.json` inside the directory of its thread. The file holds a
/// 4-byte big-endian length prefix, followed by that many bytes of UTF-8 encoded JSON.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotStore {
    max_size: u32,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(MAX_THREAD_SIZE)
    }
}

impl SnapshotStore {
    pub fn new(max_size: u32) -> Self {
        Self { max_size }
    }

    /// The path of the snapshot file for the thread saved in `thread_dir`.
    pub fn path(thread_dir: &Path) -> PathBuf {
        thread_dir.join(THREAD_FILE_NAME)
    }

    /// Loads the snapshot saved in `thread_dir`, or `None` if the thread was never saved.
    pub fn load(&self, thread_dir: &Path) -> Result<Option<ThreadSnapshot>, SnapshotError> {
        let mut file = match File::open(Self::path(thread_dir)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut prefix = [0; 4];
        read_exact(&mut file, &mut prefix)?;
        let size = u32::from_be_bytes(prefix);
        if size == 0 || size > self.max_size {
            return Err(SnapshotError::InvalidSize(size.into()));
        }

        let mut json = vec![0; size as usize];
        read_exact(&mut file, &mut json)?;

        let snapshot = serde_json::from_slice(&json)?;
        Ok(Some(snapshot))
    }

    /// Saves `posts` to `thread_dir`, merged into `old` if there is one.
    ///
    /// The file is replaced atomically, so a crash never leaves a partially written
    /// snapshot behind. Returns the snapshot that was written.
    pub fn save(
        &self,
        thread_dir: &Path,
        old: Option<&ThreadSnapshot>,
        posts: Vec<Post>,
    ) -> Result<ThreadSnapshot, SnapshotError> {
        let snapshot = match old {
            Some(old) => old.merge(posts),
            None => ThreadSnapshot::from_posts(posts),
        };

        let json = serde_json::to_vec(&snapshot)?;
        let size = u32::try_from(json.len())
            .ok()
            .filter(|size| *size <= self.max_size)
            .ok_or(SnapshotError::InvalidSize(json.len() as u64))?;

        fs::create_dir_all(thread_dir)?;
        let mut temp_file = tempfile::Builder::new()
            .prefix(".thread")
            .tempfile_in(thread_dir)?;
        temp_file.write_all(&size.to_be_bytes())?;
        temp_file.write_all(&json)?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(Self::path(thread_dir))
            .map_err(|err| err.error)?;

        tracing::debug!(
            posts = snapshot.len(),
            bytes = json.len(),
            "Saved thread to `{}`",
            thread_dir.display()
        );
        Ok(snapshot)
    }

    /// Loads the saved snapshot of `thread_dir`, merges `posts` into it and saves the result.
    pub fn update(
        &self,
        thread_dir: &Path,
        posts: Vec<Post>,
    ) -> Result<ThreadSnapshot, SnapshotError> {
        let old = self.load(thread_dir)?;
        self.save(thread_dir, old.as_ref(), posts)
    }
}

fn read_exact(file: &mut File, buf: &mut [u8]) -> Result<(), SnapshotError> {
    file.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => SnapshotError::Truncated,
        _ => err.into(),
    })
}
