//! Contentcache.
//!
//! Contentcache maintains a persistent cache of JSON payloads fetched from remote APIs. This
//! binary runs the periodic expiry sweeper, and allows inspecting and maintaining the cache
//! from the command line.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

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
