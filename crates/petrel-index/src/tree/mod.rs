//! The mailbox binary tree index.
//!
//! A persistent, memory-mapped red/black tree mapping message UIDs to
//! record positions in the owning record index. The file lives next to the
//! record index as `<index-path>.tree`; an in-memory index gets an
//! anonymous mapping instead, with identical semantics minus persistence.
//!
//! Layout and sizing live in `format`, the mapping lifecycle (remap,
//! verify, grow, truncate) in `mapping`, and the structural operations in
//! `rb`. This module owns the handle and its lifecycle: create, open,
//! reset, rebuild, sync, close.

mod format;
mod mapping;
mod rb;

#[cfg(test)]
mod format_tests;
#[cfg(test)]
mod mapping_tests;

pub use format::{TreeConfig, HEADER_SIZE, NODE_SIZE};

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::index::{LockType, RecordIndex};
use format::{TreeHeader, TreeNode};
use mapping::syscall_failed;

/// Handle to a mailbox binary tree index.
///
/// The handle either holds a valid mapping or none at all; the header and
/// node views are re-derived from the mapping on every access, so a remap
/// can never leave a dangling view behind.
///
/// Every mutating operation requires the owning record index to be
/// exclusively locked; lookups require at least the shared lock. The tree
/// asserts this and never takes locks itself, except inside [`rebuild`]
/// and the locked retry of [`open_or_create`].
///
/// [`rebuild`]: UidTree::rebuild
/// [`open_or_create`]: UidTree::open_or_create
pub struct UidTree {
    cfg: TreeConfig,
    /// Tree file path, or a synthetic label for anonymous trees.
    path: PathBuf,
    /// Backing descriptor; `None` in anonymous mode.
    file: Option<File>,
    anon: bool,
    map: Option<MmapMut>,
    /// Physical mapping size. May be less than the mapping's own length
    /// right after a repair-truncate; all access is bounded by this.
    full_len: usize,
    /// Bytes logically in use, mirroring the header's `used_file_size`.
    used_len: usize,
    /// Greatest byte offset dirtied since the last flush; bounds `msync`.
    highwater: usize,
    /// Cached copy of the header's `sync_id`; a mismatch means another
    /// opener changed the file size and we must remap.
    cached_sync_id: u32,
    modified: bool,
}

impl UidTree {
    /// Creates a fresh tree for `owner` and populates it from the owner's
    /// records.
    ///
    /// The owner must already be exclusively locked. An in-memory owner
    /// (no filepath) gets an anonymous tree.
    pub fn create(owner: &dyn RecordIndex, cfg: TreeConfig) -> Result<Self> {
        assert_eq!(
            owner.lock_type(),
            LockType::Exclusive,
            "tree create requires the exclusive index lock"
        );

        let mut tree = match owner.filepath() {
            Some(index_path) => Self::open_file(owner, index_path, cfg)?,
            None => Self::new_anon(cfg),
        };
        tree.rebuild(owner)?;
        Ok(tree)
    }

    /// Opens the tree file next to `owner`'s index file, creating and
    /// rebuilding it when missing or unusable.
    ///
    /// The happy path runs under whatever lock the caller holds. On any
    /// failure the lock is escalated to exclusive and the open retried, so
    /// two processes noticing a broken file at the same time rebuild it
    /// only once; if the file is still unusable it is rebuilt from the
    /// record index. The lock is left in the escalated state for the
    /// caller to downgrade.
    pub fn open_or_create(owner: &dyn RecordIndex, cfg: TreeConfig) -> Result<Self> {
        let Some(index_path) = owner.filepath() else {
            // nothing on disk to reopen; build the anonymous tree directly
            let mut tree = Self::new_anon(cfg);
            tree.rebuild(owner)?;
            return Ok(tree);
        };

        let mut tree = Self::open_file(owner, index_path, cfg)?;
        if tree.open_init(owner).is_ok() {
            return Ok(tree);
        }

        // lock and check again, so two processes noticing the error at the
        // same time don't both rebuild
        owner.set_lock(LockType::Exclusive)?;

        // the failed attempt may have unlinked a corrupt file; reopen so a
        // rebuild lands in a fresh inode, not the unlinked one
        drop(tree);
        let mut tree = Self::open_file(owner, index_path, cfg)?;
        if tree.open_init(owner).is_err() {
            tree.rebuild(owner)?;
        }
        Ok(tree)
    }

    /// Resets the tree to an empty state: fresh header, sentinel node,
    /// file resized to the minimum. Requires the exclusive lock.
    ///
    /// On failure the owner's rebuild flag is set so the next opener
    /// retries.
    pub fn reset(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        assert_eq!(
            owner.lock_type(),
            LockType::Exclusive,
            "tree reset requires the exclusive index lock"
        );

        let result = self.init(owner).and_then(|()| {
            if self.anon {
                Ok(())
            } else {
                self.ensure_current(owner, true)
            }
        });
        if result.is_err() {
            owner.request_tree_rebuild();
        }
        result
    }

    /// Rebuilds the tree from the owner's records: resets, then inserts
    /// every `(uid, position)` pair in ascending UID order.
    ///
    /// Takes the exclusive lock itself and leaves it held. An insert
    /// failure sets the owner's rebuild flag and propagates, so the next
    /// opener tries again.
    pub fn rebuild(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        owner.set_lock(LockType::Exclusive)?;
        self.reset(owner)?;

        tracing::debug!(path = %self.path.display(), "rebuilding binary tree from record index");
        for (uid, position) in owner.records() {
            if let Err(err) = self.insert(owner, uid, position) {
                owner.request_tree_rebuild();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Flushes dirty pages to disk if anything was modified.
    ///
    /// Returns the backing file when a flush happened so the caller can
    /// batch its `fsync` with the other mailbox files; `None` when the
    /// tree was clean or anonymous.
    pub fn sync_file(&mut self, owner: &dyn RecordIndex) -> Result<Option<&File>> {
        if !self.modified || self.anon {
            return Ok(None);
        }

        self.map
            .as_ref()
            .expect("modified tree must be mapped")
            .flush_range(0, self.highwater)
            .map_err(|err| self.syscall_failed(owner, "msync()", err))?;

        self.highwater = self.used_len;
        self.modified = false;
        Ok(self.file.as_ref())
    }

    /// Releases the mapping and descriptor. Dropping the handle does the
    /// same; this exists for callers that need the unmap to happen at a
    /// known point, e.g. before unlinking the whole mailbox.
    pub fn close(&mut self) {
        // mapping goes before the descriptor
        self.map = None;
        self.full_len = 0;
        self.used_len = 0;
        self.highwater = 0;
        self.file = None;
    }

    /// Bytes logically in use, header included.
    #[must_use]
    pub fn used_file_size(&self) -> u64 {
        self.used_len as u64
    }

    /// Physical size of the current mapping.
    #[must_use]
    pub fn mapped_file_size(&self) -> u64 {
        self.full_len as u64
    }

    /// The header's size-change counter as last observed by this handle.
    #[must_use]
    pub fn sync_id(&self) -> u32 {
        self.cached_sync_id
    }

    /// Number of data nodes (the sentinel is not counted).
    #[must_use]
    pub fn record_count(&self) -> u32 {
        if self.map.is_none() {
            return 0;
        }
        u32::try_from((self.used_len - HEADER_SIZE) / NODE_SIZE - 1).expect("node count fits u32")
    }

    /// True when there are unflushed modifications.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// True for in-memory (anonymous-mapping) trees.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.anon
    }

    /// The tree file path, or the synthetic label of an anonymous tree.
    #[must_use]
    pub fn filepath(&self) -> &Path {
        &self.path
    }

    fn open_file(owner: &dyn RecordIndex, index_path: &Path, cfg: TreeConfig) -> Result<Self> {
        let mut os = index_path.as_os_str().to_os_string();
        os.push(".tree");
        let path = PathBuf::from(os);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| syscall_failed(owner, "open()", &path, err))?;

        Ok(Self {
            cfg,
            path,
            file: Some(file),
            anon: false,
            map: None,
            full_len: 0,
            used_len: 0,
            highwater: 0,
            cached_sync_id: 0,
            modified: false,
        })
    }

    fn new_anon(cfg: TreeConfig) -> Self {
        Self {
            cfg,
            path: PathBuf::from("(in-memory tree index)"),
            file: None,
            anon: true,
            map: None,
            full_len: 0,
            used_len: 0,
            highwater: 0,
            cached_sync_id: 0,
            modified: false,
        }
    }

    /// Maps and verifies an existing file. Fails with
    /// [`Error::Uninitialized`] for a zero-length file and with corruption
    /// for anything that does not pass verification, including an
    /// `indexid` that belongs to some other index.
    fn open_init(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        self.remap(owner)?;
        if self.map.is_none() {
            return Err(Error::Uninitialized {
                path: self.path.clone(),
            });
        }

        self.verify(owner)?;

        let indexid = self.header().indexid;
        if indexid != owner.indexid() {
            return Err(self.set_corrupted(
                owner,
                format!(
                    "indexid mismatch ({:#010x} vs {:#010x})",
                    indexid,
                    owner.indexid()
                ),
            ));
        }
        Ok(())
    }

    /// Writes a fresh header and sentinel and sizes the backing to the
    /// minimum. The sentinel node is always allocated: it is the red/black
    /// null and the root anchor.
    fn init(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        let header = TreeHeader {
            indexid: owner.indexid(),
            sync_id: 0,
            used_file_size: (HEADER_SIZE + NODE_SIZE) as u64,
        };
        let mut buf = [0u8; HEADER_SIZE + NODE_SIZE];
        header.write(&mut buf);
        TreeNode::default().write(&mut buf[HEADER_SIZE..]);

        if self.anon {
            let min = self.cfg.min_size();
            let mut map = MmapMut::map_anon(min)
                .map_err(|err| self.syscall_failed(owner, "mmap_anon()", err))?;
            map[..buf.len()].copy_from_slice(&buf);
            self.map = Some(map);
            self.full_len = min;
            return self.verify(owner);
        }

        let file = self.file.as_ref().expect("file-backed tree has a descriptor");
        (&*file)
            .seek(SeekFrom::Start(0))
            .map_err(|err| syscall_failed(owner, "lseek()", &self.path, err))?;
        (&*file)
            .write_all(&buf)
            .map_err(|err| syscall_failed(owner, "write_full()", &self.path, err))?;
        file.set_len(self.cfg.min_size() as u64)
            .map_err(|err| syscall_failed(owner, "file_set_size()", &self.path, err))?;
        Ok(())
    }
}

impl Drop for UidTree {
    fn drop(&mut self) {
        // best-effort: push dirty pages out before the mapping goes away;
        // the kernel would write them back eventually, but not ordered
        // against anything the caller does next
        if self.modified && !self.anon {
            if let Some(map) = &self.map {
                if let Err(err) = map.flush_range(0, self.highwater) {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to flush binary tree mapping on close"
                    );
                }
            }
        }
    }
}
