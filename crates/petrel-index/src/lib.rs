//! # Petrel mailbox index
//!
//! Index structures for the petrel IMAP server. The centerpiece is
//! [`UidTree`]: a persistent, memory-mapped binary tree that maps message
//! UIDs to record positions in the sibling record-index file, so a UID can
//! be resolved without scanning the whole mailbox.
//!
//! The tree is an auxiliary structure: it can always be rebuilt from the
//! record index it belongs to. That shapes the whole design — corruption is
//! detected aggressively, the broken file is unlinked, and the next opener
//! rebuilds from scratch rather than attempting any in-place repair.
//!
//! ## Concurrency model
//!
//! A process is single-threaded with respect to one mailbox; the real
//! concurrency story is multiple *processes* sharing the mapped file.
//! Coordination happens through the owning record-index lock (asserted, not
//! acquired, by the tree) and a `sync_id` counter in the tree header that is
//! bumped on every file size change so stale openers know to remap.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use petrel_index::{LockType, MemoryIndex, RecordIndex, TreeConfig, UidTree};
//!
//! fn main() -> petrel_index::Result<()> {
//!     let index = MemoryIndex::with_filepath(0x1234_5678, "/var/mail/inbox.idx");
//!     index.set_lock(LockType::Exclusive)?;
//!
//!     let mut tree = UidTree::open_or_create(&index, TreeConfig::default())?;
//!     tree.insert(&index, 1, 0)?;
//!     tree.insert(&index, 2, 1)?;
//!
//!     index.set_lock(LockType::Shared)?;
//!     assert_eq!(tree.lookup(&index, 2)?, Some(1));
//!     # Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod index;
pub mod tree;

pub use error::{Error, Result};
pub use index::{LockType, MemoryIndex, RecordIndex, REBUILD_TREE};
pub use tree::{TreeConfig, UidTree, HEADER_SIZE, NODE_SIZE};
