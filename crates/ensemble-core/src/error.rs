//! Core error types

use thiserror::Error;

/// Fatal errors surfaced to the process entry point.
///
/// Everything recoverable on the audio path (full ring, missing frame,
/// dead session) is handled in place; these variants are the ones that
/// abort startup.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a mixer or reaper thread
    #[error("failed to spawn {name} thread")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
