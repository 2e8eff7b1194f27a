//! Error types for the authentication databases.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the authentication databases.
#[derive(Error, Debug)]
pub enum Error {
    /// The passwd file could not be read.
    #[error("failed to read passwd file {path}: {source}")]
    Io {
        /// The file being read.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Result type alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
