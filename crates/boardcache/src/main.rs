//! Boardcache.
//!
//! A command line frontend to the boardcache services. It fetches media and thread JSON through
//! the coalescing caches, merges thread snapshots on disk and cleans up the response cache.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod commands;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
