use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Result, anyhow};

use crate::config::Config;

use super::ResponseCache;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// This will clean up the response cache based on configured cache retention.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<CleanupStats> {
    let cache = ResponseCache::from_config(&config)?.ok_or_else(|| {
        anyhow!("no caching configured! Did you provide a path to your config file?")
    })?;
    cache.cleanup(dry_run)
}

/// What a cleanup run removed and retained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// A file that survived the expiration pass, and might still be removed to fit `max_size`.
struct Retained {
    path: PathBuf,
    mtime: SystemTime,
    size: u64,
}

impl ResponseCache {
    /// Clear the temporary files.
    ///
    /// We need to do this on startup to avoid accidentally leaving temporary files which
    /// survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)?;
        Ok(())
    }

    /// Cleans up this cache based on configured cache retention.
    ///
    /// First, all responses that have not been used for `max_unused_for` are removed. Then,
    /// if the remaining responses exceed `max_size`, the least recently used ones are
    /// removed until they fit.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up `{}` cache", self.name());

        let mut stats = CleanupStats::default();
        let mut retained = Vec::new();
        self.cleanup_directory_recursive(&self.cache_dir, &mut stats, &mut retained, dry_run)?;
        self.enforce_max_size(retained, &mut stats, dry_run);

        tracing::info!("Cleaning up `{}` complete", self.name());
        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => self.name().as_ref());
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => self.name().as_ref());
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => self.name().as_ref());
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => self.name().as_ref());

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        retained: &mut Vec<Retained>,
        dry_run: bool,
    ) -> Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty =
                    self.cleanup_directory_recursive(&path, stats, retained, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = remove_dir(&path) {
                            sentry::with_scope(
                                |scope| scope.set_extra("path", path.display().to_string().into()),
                                || tracing::error!("Failed to clean cache directory: {:?}", e),
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, retained, dry_run) {
                    Err(e) => {
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.display().to_string().into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    ///
    /// If `dry_run` is `true`, the file will not actually be deleted.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        retained: &mut Vec<Retained>,
        dry_run: bool,
    ) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();
        let mtime = metadata.modified()?;

        if catch_not_found(|| self.check_mtime(mtime))?.is_none() {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;
        retained.push(Retained {
            path: path.to_owned(),
            mtime,
            size,
        });

        Ok(false)
    }

    /// Removes the least recently used files until the retained ones fit `max_size`.
    ///
    /// Directories emptied by this pass are left for the next cleanup run.
    fn enforce_max_size(
        &self,
        mut retained: Vec<Retained>,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) {
        let Some(max_size) = self.config.max_size else {
            return;
        };
        if stats.retained_bytes <= max_size {
            return;
        }

        retained.sort_by_key(|file| file.mtime);
        for file in retained {
            if stats.retained_bytes <= max_size {
                break;
            }

            tracing::debug!("Removing file `{}` to fit max_size", file.path.display());
            if !dry_run {
                if let Err(e) = catch_not_found(|| remove_file(&file.path)) {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", file.path.display().to_string().into()),
                        || tracing::error!("Failed to clean cache file: {:?}", e),
                    );
                    continue;
                }
            }

            stats.retained_bytes -= file.size;
            stats.retained_files -= 1;
            stats.removed_bytes += file.size;
            stats.removed_files += 1;
        }
    }
}
