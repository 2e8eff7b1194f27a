//! Mapping lifecycle of the tree file.
//!
//! The whole file is mapped read-write and accessed through bounds-guarded
//! byte views. Size changes are coordinated across processes with the
//! header's `sync_id`: every grow or truncate bumps it, and a handle whose
//! cached value no longer matches remaps before touching anything else.
//!
//! Failure policy (by side effect):
//! - out of disk space: flag the owning index `nodiskspace`, change nothing
//! - other syscall errors: record a message on the owning index
//! - verification failures: mark the owning index inconsistent and unlink
//!   the file, so the next opener rebuilds instead of tripping over it

use std::io;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{self, Error, Result};
use crate::index::{LockType, RecordIndex};

use super::format::{TreeHeader, TreeNode, HEADER_SIZE, NODE_SIZE};
use super::UidTree;

/// Classifies a failed syscall and records it on the owning index.
pub(super) fn syscall_failed(
    owner: &dyn RecordIndex,
    function: &'static str,
    path: &Path,
    source: io::Error,
) -> Error {
    if error::is_no_space(&source) {
        owner.set_nodiskspace();
        return Error::NoDiskSpace;
    }
    owner.set_error(format!(
        "{function} failed with binary tree file {}: {source}",
        path.display()
    ));
    Error::Syscall {
        function,
        path: path.to_path_buf(),
        source,
    }
}

impl UidTree {
    pub(super) fn syscall_failed(
        &self,
        owner: &dyn RecordIndex,
        function: &'static str,
        source: io::Error,
    ) -> Error {
        syscall_failed(owner, function, &self.path, source)
    }

    /// Records corruption: marks the owning index inconsistent and unlinks
    /// the file. The descriptor and mapping stay open on purpose — other
    /// processes still holding them keep a live inode until they close.
    pub(super) fn set_corrupted(&self, owner: &dyn RecordIndex, reason: String) -> Error {
        tracing::warn!(
            path = %self.path.display(),
            reason = %reason,
            "binary tree file is corrupted; unlinking"
        );
        owner.set_error(format!(
            "Corrupted binary tree file {}: {reason}",
            self.path.display()
        ));
        owner.set_inconsistent();
        if !self.anon {
            let _ = std::fs::remove_file(&self.path);
        }
        Error::Corrupted {
            path: self.path.clone(),
            reason,
        }
    }

    /// Drops any existing mapping (flushing first if dirty) and maps the
    /// file at its current length. A zero-length file leaves the handle
    /// unmapped; the caller decides whether that means "just created".
    ///
    /// Anonymous trees never come through here.
    pub(super) fn remap(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        debug_assert!(!self.anon, "anonymous trees are never remapped from a file");

        if self.modified {
            if let Some(map) = &self.map {
                // make sure we're synced before the unmap
                map.flush_range(0, self.highwater)
                    .map_err(|err| self.syscall_failed(owner, "msync()", err))?;
            }
        }
        self.modified = false;
        self.map = None;
        self.full_len = 0;
        self.used_len = 0;
        self.highwater = 0;

        let file = self.file.as_ref().expect("file-backed tree has a descriptor");
        let file_len = file
            .metadata()
            .map_err(|err| syscall_failed(owner, "fstat()", &self.path, err))?
            .len();
        if file_len == 0 {
            return Ok(());
        }
        assert!(file_len <= isize::MAX as u64, "tree file length overflows a mapping");

        // SAFETY: the descriptor is open read-write and stays open for the
        // lifetime of the mapping; all access goes through bounds-checked
        // slices of the mapping. Other processes mutate the file only under
        // the index lock discipline this handle asserts.
        let map = unsafe { MmapMut::map_mut(file) }
            .map_err(|err| syscall_failed(owner, "mmap()", &self.path, err))?;
        self.full_len = file_len as usize;
        self.map = Some(map);
        Ok(())
    }

    /// Verifies a fresh mapping and adopts the header's view of the file.
    ///
    /// A trailing partial node (a crashed writer's half-finished grow) is
    /// repaired by truncating the remainder — but only under the exclusive
    /// lock; under a shared lock this fails with [`Error::LockRequired`]
    /// and the caller escalates. Everything else that does not add up is
    /// corruption.
    pub(super) fn verify(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        if self.full_len < HEADER_SIZE + NODE_SIZE {
            return Err(self.set_corrupted(
                owner,
                format!("file too small ({} bytes)", self.full_len),
            ));
        }

        let extra = (self.full_len - HEADER_SIZE) % NODE_SIZE;
        if extra != 0 {
            // partial write or corruption; drop the trailing bytes
            if owner.lock_type() != LockType::Exclusive {
                return Err(Error::LockRequired {
                    path: self.path.clone(),
                });
            }
            self.full_len -= extra;
            tracing::warn!(
                path = %self.path.display(),
                extra,
                "truncating trailing partial node from binary tree file"
            );
            if let Some(file) = &self.file {
                if let Err(err) = file.set_len(self.full_len as u64) {
                    // the in-memory view is already clipped; keep going
                    let _ = self.syscall_failed(owner, "ftruncate()", err);
                }
            }
        }

        let header = self.header();
        if header.used_file_size > self.full_len as u64 {
            return Err(self.set_corrupted(
                owner,
                format!(
                    "used_file_size larger than real file size ({} vs {})",
                    header.used_file_size, self.full_len
                ),
            ));
        }
        let used = header.used_file_size as usize;
        if used < HEADER_SIZE + NODE_SIZE || (used - HEADER_SIZE) % NODE_SIZE != 0 {
            return Err(self.set_corrupted(
                owner,
                format!("invalid used_file_size in header ({used})"),
            ));
        }

        self.cached_sync_id = header.sync_id;
        self.used_len = used;
        self.highwater = used;
        Ok(())
    }

    /// The cheap coherence check run at the top of every operation.
    ///
    /// If our cached `sync_id` still matches the header, the file size has
    /// not changed and only `used_file_size` needs refreshing (another
    /// process may have inserted within the existing capacity). Otherwise,
    /// or when `forced`, remap and re-verify.
    pub(super) fn ensure_current(&mut self, owner: &dyn RecordIndex, forced: bool) -> Result<()> {
        if !self.anon && owner.mmap_invalidate() {
            self.flush_invalidate(owner)?;
        }

        if !forced && self.map.is_some() && self.cached_sync_id == self.header().sync_id {
            let used = self.header().used_file_size;
            assert!(
                used <= self.full_len as u64,
                "tree file was grown without updating sync_id"
            );
            self.used_len = used as usize;
            return Ok(());
        }

        if self.anon {
            // anonymous mappings have exactly one opener; they can't go
            // stale underneath us
            debug_assert!(self.map.is_some(), "anonymous tree lost its mapping");
            return Ok(());
        }

        self.remap(owner)?;
        if self.map.is_none() {
            return Err(self.set_corrupted(owner, "file shrank to zero length".to_string()));
        }
        self.verify(owner)
    }

    /// Extends the file (or anonymous region) by one growth step.
    ///
    /// File-backed: extend, bump `sync_id` so other openers remap, then
    /// forced remap + verify for ourselves. Anonymous: allocate a larger
    /// region, copy, swap. New node slots are left uninitialized either
    /// way; allocation happens lazily at insert.
    pub(super) fn grow(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        let grow_count = (owner.messages_count() as usize * self.cfg.grow_percentage as usize
            / 100)
            .max(16);
        let new_fsize = self.full_len + grow_count * NODE_SIZE;
        assert!(
            (new_fsize as u64) < i64::MAX as u64,
            "tree file size overflows a file offset"
        );

        if self.anon {
            assert!(new_fsize <= isize::MAX as usize, "anonymous tree size overflows");
            let mut new_map = MmapMut::map_anon(new_fsize)
                .map_err(|err| self.syscall_failed(owner, "mmap_anon()", err))?;
            let old_map = self.map.as_ref().expect("anonymous tree is mapped");
            new_map[..self.full_len].copy_from_slice(&old_map[..self.full_len]);
            self.map = Some(new_map);
            self.full_len = new_fsize;
            return self.verify(owner);
        }

        let file = self.file.as_ref().expect("file-backed tree has a descriptor");
        file.set_len(new_fsize as u64)
            .map_err(|err| syscall_failed(owner, "file_set_size()", &self.path, err))?;
        tracing::debug!(
            path = %self.path.display(),
            new_fsize,
            "grew binary tree file"
        );

        // file size changed; let the other openers know by bumping sync_id
        self.bump_sync_id();
        self.modified = true;

        self.ensure_current(owner, true)
    }

    /// Shrinks the file when most of it is free space. Requires the
    /// exclusive lock. Does not remap — our own next access notices the
    /// bumped `sync_id` and remaps, same as every other opener.
    pub(super) fn truncate(&mut self, owner: &dyn RecordIndex) -> Result<()> {
        debug_assert_eq!(
            owner.lock_type(),
            LockType::Exclusive,
            "tree truncate requires the exclusive index lock"
        );

        if self.anon || self.full_len <= self.cfg.min_size() {
            return Ok(());
        }

        let empty_space = self.full_len - self.used_len;
        let truncate_threshold = self.full_len / 100 * self.cfg.truncate_percentage as usize;
        if empty_space <= truncate_threshold {
            return Ok(());
        }

        let mut new_len =
            self.used_len + empty_space * self.cfg.truncate_keep_percentage as usize / 100;
        // keep the size node-aligned
        new_len -= (new_len - HEADER_SIZE) % NODE_SIZE;
        new_len = new_len.max(self.cfg.min_size());

        let file = self.file.as_ref().expect("file-backed tree has a descriptor");
        if let Err(err) = file.set_len(new_len as u64) {
            // the file keeps its old size; leave our view alone and let the
            // caller's error handling see the record
            let _ = self.syscall_failed(owner, "ftruncate()", err);
            return Ok(());
        }

        tracing::debug!(
            path = %self.path.display(),
            old_len = self.full_len,
            new_len,
            "truncated binary tree file"
        );
        self.full_len = new_len;
        self.bump_sync_id();
        Ok(())
    }

    /// Synchronous invalidating flush of the in-use range, issued when the
    /// owning index wants the page cache dropped before a remap.
    #[cfg(unix)]
    fn flush_invalidate(&self, owner: &dyn RecordIndex) -> Result<()> {
        let Some(map) = &self.map else { return Ok(()) };

        // SAFETY: the pointer and length denote the live mapping owned by
        // this handle; msync does not alias or retain them.
        let rc = unsafe {
            libc::msync(
                map.as_ptr() as *mut libc::c_void,
                self.used_len,
                libc::MS_SYNC | libc::MS_INVALIDATE,
            )
        };
        if rc != 0 {
            return Err(self.syscall_failed(owner, "msync()", io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn flush_invalidate(&self, owner: &dyn RecordIndex) -> Result<()> {
        let Some(map) = &self.map else { return Ok(()) };
        map.flush()
            .map_err(|err| self.syscall_failed(owner, "msync()", err))
    }

    // -----------------------------------------------------------------
    // Header and node views. Always re-derived from the mapping, never
    // held across a call that can remap.
    // -----------------------------------------------------------------

    pub(super) fn header(&self) -> TreeHeader {
        let map = self.map.as_ref().expect("tree is not mapped");
        TreeHeader::read(&map[..HEADER_SIZE])
    }

    pub(super) fn write_header(&mut self, header: TreeHeader) {
        let map = self.map.as_mut().expect("tree is not mapped");
        header.write(&mut map[..HEADER_SIZE]);
        self.highwater = self.highwater.max(HEADER_SIZE);
    }

    fn bump_sync_id(&mut self) {
        let mut header = self.header();
        // wraparound is assumed out of service life; see TreeHeader
        header.sync_id = header.sync_id.wrapping_add(1);
        self.write_header(header);
    }

    /// Number of allocated node slots, sentinel included.
    pub(super) fn node_count(&self) -> u32 {
        u32::try_from((self.used_len - HEADER_SIZE) / NODE_SIZE).expect("node count fits u32")
    }

    /// Reads node `idx`. Reading an unallocated slot is a programmer
    /// error.
    pub(super) fn node(&self, idx: u32) -> TreeNode {
        let offset = HEADER_SIZE + idx as usize * NODE_SIZE;
        assert!(
            offset + NODE_SIZE <= self.used_len,
            "node read out of bounds (index {idx}, used {})",
            self.used_len
        );
        let map = self.map.as_ref().expect("tree is not mapped");
        TreeNode::read(&map[offset..offset + NODE_SIZE])
    }

    /// Writes node `idx`. The slot must be within the mapped capacity;
    /// writing one slot past `used_len` is how insert allocates.
    pub(super) fn set_node(&mut self, idx: u32, node: TreeNode) {
        let offset = HEADER_SIZE + idx as usize * NODE_SIZE;
        assert!(
            offset + NODE_SIZE <= self.full_len,
            "node write out of bounds (index {idx}, capacity {})",
            self.full_len
        );
        let map = self.map.as_mut().expect("tree is not mapped");
        node.write(&mut map[offset..offset + NODE_SIZE]);
        self.highwater = self.highwater.max(offset + NODE_SIZE);
    }

    /// Updates the logical file size, both in memory and in the header.
    pub(super) fn set_used_len(&mut self, used: usize) {
        self.used_len = used;
        let mut header = self.header();
        header.used_file_size = used as u64;
        self.write_header(header);
    }
}
