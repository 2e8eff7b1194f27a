//! Error types for the mailbox index.
//!
//! The binary tree distinguishes three failure kinds by side effect:
//! disk-full sets `nodiskspace` on the owning index and changes nothing on
//! disk, other syscall failures record a descriptive message, and
//! verification failures mark the owning index inconsistent and unlink the
//! tree file so the next opener rebuilds it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the mailbox index subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// The filesystem is out of space or quota. The owning index has been
    /// flagged `nodiskspace`; no file state was changed.
    #[error("no space left on device")]
    NoDiskSpace,

    /// A syscall failed for a reason other than disk space. A descriptive
    /// message has been recorded on the owning index.
    #[error("{function} failed with binary tree file {path}: {source}")]
    Syscall {
        /// The syscall (or syscall wrapper) that failed.
        function: &'static str,
        /// Tree file the call was operating on.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The tree file failed verification. The owning index has been marked
    /// inconsistent and the file unlinked; the caller must rebuild.
    #[error("corrupted binary tree file {path}: {reason}")]
    Corrupted {
        /// Tree file that failed verification.
        path: PathBuf,
        /// What the verifier objected to.
        reason: String,
    },

    /// The tree file is empty (just created, or recreated behind our back)
    /// and carries no header yet; it must be initialized via rebuild.
    #[error("binary tree file {path} is not initialized")]
    Uninitialized {
        /// The empty tree file.
        path: PathBuf,
    },

    /// The file has a trailing partial node that can only be repaired under
    /// the exclusive index lock. Escalate the lock and retry.
    #[error("binary tree file {path} needs repair under the exclusive index lock")]
    LockRequired {
        /// Tree file needing repair.
        path: PathBuf,
    },

    /// The owning record index failed a lock transition.
    #[error("record index lock failed: {0}")]
    Lock(String),
}

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// True when `err` means the disk or quota is full.
pub(crate) fn is_no_space(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(libc::ENOSPC | libc::EDQUOT))
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}
