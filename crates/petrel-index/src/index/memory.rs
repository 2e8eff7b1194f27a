//! In-memory record index.
//!
//! A minimal [`RecordIndex`] implementation backed by a `Vec`. It is what
//! anonymous trees hang off in production (an in-memory mailbox has no
//! files at all) and what the tree tests drive; the mmap-backed record
//! index lives elsewhere in the server.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use super::{LockType, RecordIndex, REBUILD_TREE};
use crate::error::Result;

/// Record index held entirely in memory.
///
/// Single-process by construction, so `set_lock` never blocks; it only
/// tracks the state the tree asserts. Positions are assigned densely in
/// append order, which is exactly what `INDEX_RECORD_INDEX` yields for the
/// file-backed index.
pub struct MemoryIndex {
    indexid: u32,
    filepath: Option<PathBuf>,
    /// UID per position, ascending; position == vec index.
    records: RwLock<Vec<u32>>,
    lock: Mutex<LockType>,
    flags: AtomicU32,
    nodiskspace: AtomicBool,
    inconsistent: AtomicBool,
    mmap_invalidate: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl MemoryIndex {
    /// Creates an in-memory index with no backing file. Trees created for
    /// it are anonymous.
    #[must_use]
    pub fn new(indexid: u32) -> Self {
        Self {
            indexid,
            filepath: None,
            records: RwLock::new(Vec::new()),
            lock: Mutex::new(LockType::Unlock),
            flags: AtomicU32::new(0),
            nodiskspace: AtomicBool::new(false),
            inconsistent: AtomicBool::new(false),
            mmap_invalidate: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    /// Creates an index that claims `path` as its record file, so its tree
    /// is file-backed at `<path>.tree`.
    #[must_use]
    pub fn with_filepath<P: AsRef<Path>>(indexid: u32, path: P) -> Self {
        Self {
            filepath: Some(path.as_ref().to_path_buf()),
            ..Self::new(indexid)
        }
    }

    /// Appends a record and returns its position. UIDs are assigned
    /// monotonically and never reused; appending out of order is a
    /// programmer error.
    pub fn append_record(&self, uid: u32) -> u32 {
        let mut records = self.records.write();
        if let Some(&last) = records.last() {
            assert!(uid > last, "record UIDs must be appended in ascending order");
        }
        records.push(uid);
        u32::try_from(records.len() - 1).expect("record count fits in u32")
    }

    /// Current header flags (`REBUILD_TREE` et al.).
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// True when a tree operation hit a full disk.
    #[must_use]
    pub fn nodiskspace(&self) -> bool {
        self.nodiskspace.load(Ordering::Relaxed)
    }

    /// True when the index was marked inconsistent.
    #[must_use]
    pub fn inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::Relaxed)
    }

    /// Clears the inconsistency marker, as the server does once a rebuild
    /// has brought the auxiliary files back in line.
    pub fn clear_inconsistent(&self) {
        self.inconsistent.store(false, Ordering::Relaxed);
    }

    /// Makes subsequent tree flushes invalidate the page cache.
    pub fn set_mmap_invalidate(&self, value: bool) {
        self.mmap_invalidate.store(value, Ordering::Relaxed);
    }

    /// Last error message recorded by a tree operation, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl RecordIndex for MemoryIndex {
    fn indexid(&self) -> u32 {
        self.indexid
    }

    fn filepath(&self) -> Option<&Path> {
        self.filepath.as_deref()
    }

    fn lock_type(&self) -> LockType {
        *self.lock.lock()
    }

    fn set_lock(&self, lock: LockType) -> Result<()> {
        *self.lock.lock() = lock;
        Ok(())
    }

    fn messages_count(&self) -> u32 {
        u32::try_from(self.records.read().len()).expect("record count fits in u32")
    }

    fn mmap_invalidate(&self) -> bool {
        self.mmap_invalidate.load(Ordering::Relaxed)
    }

    fn records(&self) -> Box<dyn Iterator<Item = (u32, u32)> + '_> {
        // snapshot so callers can mutate the tree while iterating
        let records = self.records.read().clone();
        Box::new(
            records
                .into_iter()
                .enumerate()
                .map(|(pos, uid)| (uid, u32::try_from(pos).expect("position fits in u32"))),
        )
    }

    fn request_tree_rebuild(&self) {
        self.flags.fetch_or(REBUILD_TREE, Ordering::Relaxed);
    }

    fn set_nodiskspace(&self) {
        self.nodiskspace.store(true, Ordering::Relaxed);
    }

    fn set_inconsistent(&self) {
        self.inconsistent.store(true, Ordering::Relaxed);
    }

    fn set_error(&self, message: String) {
        tracing::debug!(error = %message, "index error recorded");
        *self.last_error.lock() = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_yield_uid_position_pairs() {
        let index = MemoryIndex::new(1);
        assert_eq!(index.append_record(10), 0);
        assert_eq!(index.append_record(11), 1);
        assert_eq!(index.append_record(40), 2);

        let pairs: Vec<_> = index.records().collect();
        assert_eq!(pairs, vec![(10, 0), (11, 1), (40, 2)]);
        assert_eq!(index.messages_count(), 3);
    }

    #[test]
    #[should_panic(expected = "ascending order")]
    fn test_out_of_order_append_panics() {
        let index = MemoryIndex::new(1);
        index.append_record(5);
        index.append_record(5);
    }

    #[test]
    fn test_flag_sinks() {
        let index = MemoryIndex::new(1);
        assert_eq!(index.flags(), 0);
        index.request_tree_rebuild();
        assert_eq!(index.flags() & REBUILD_TREE, REBUILD_TREE);

        assert!(!index.inconsistent());
        index.set_inconsistent();
        assert!(index.inconsistent());
        index.clear_inconsistent();
        assert!(!index.inconsistent());

        index.set_error("boom".to_string());
        assert_eq!(index.last_error().as_deref(), Some("boom"));
    }
}
