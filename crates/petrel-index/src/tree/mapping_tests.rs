//! Mapping lifecycle tests: open/create, verification, repair, growth
//! visibility across handles, flush bookkeeping.
//!
//! Raw-byte corruption fixtures write straight into the tree file; offsets
//! come from the layout documented in `format`.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use tempfile::TempDir;

use super::format::TreeConfig;
use super::{UidTree, HEADER_SIZE, NODE_SIZE};
use crate::index::{LockType, MemoryIndex, RecordIndex};

fn small_config() -> TreeConfig {
    TreeConfig {
        min_records: 8,
        ..TreeConfig::default()
    }
}

fn file_index(dir: &TempDir, indexid: u32) -> MemoryIndex {
    let index = MemoryIndex::with_filepath(indexid, dir.path().join("mailbox.idx"));
    index.set_lock(LockType::Exclusive).expect("lock");
    index
}

fn tree_path(dir: &TempDir) -> PathBuf {
    dir.path().join("mailbox.idx.tree")
}

/// Overwrites `len` bytes at `offset` in the tree file.
fn patch_file(dir: &TempDir, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .write(true)
        .open(tree_path(dir))
        .expect("open tree file");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(bytes).expect("patch");
}

// ---------------------------------------------------------------------------
// Create / reopen
// ---------------------------------------------------------------------------

#[test]
fn test_create_writes_minimum_sized_file() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    let tree = UidTree::create(&index, small_config()).expect("create");
    assert!(!tree.is_anonymous());
    assert_eq!(tree.mapped_file_size(), small_config().min_size() as u64);
    assert_eq!(tree.used_file_size(), (HEADER_SIZE + NODE_SIZE) as u64);
    assert_eq!(
        fs::metadata(tree_path(&dir)).expect("metadata").len(),
        small_config().min_size() as u64
    );
}

#[test]
fn test_reopen_sees_persisted_records() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    {
        let mut tree = UidTree::create(&index, small_config()).expect("create");
        tree.insert(&index, 1, 0).expect("insert");
        tree.insert(&index, 2, 1).expect("insert");
        tree.sync_file(&index).expect("sync");
    }

    index.set_lock(LockType::Shared).expect("lock");
    let mut tree = UidTree::open_or_create(&index, small_config()).expect("reopen");
    assert_eq!(tree.lookup(&index, 1).expect("lookup"), Some(0));
    assert_eq!(tree.lookup(&index, 2).expect("lookup"), Some(1));
    assert_eq!(tree.record_count(), 2);
}

#[test]
fn test_opening_zero_length_file_initializes_header_and_sentinel() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);
    fs::write(tree_path(&dir), b"").expect("touch");

    let tree = UidTree::open_or_create(&index, small_config()).expect("open");
    assert_eq!(tree.record_count(), 0);
    assert_eq!(tree.used_file_size(), (HEADER_SIZE + NODE_SIZE) as u64);
    assert_eq!(
        fs::metadata(tree_path(&dir)).expect("metadata").len(),
        small_config().min_size() as u64
    );
}

#[test]
fn test_in_memory_index_gets_anonymous_tree() {
    let index = MemoryIndex::new(0x2222);
    index.set_lock(LockType::Exclusive).expect("lock");
    index.append_record(4);

    let mut tree = UidTree::open_or_create(&index, small_config()).expect("open");
    assert!(tree.is_anonymous());
    assert_eq!(tree.lookup(&index, 4).expect("lookup"), Some(0));
}

// ---------------------------------------------------------------------------
// Verification and repair
// ---------------------------------------------------------------------------

#[test]
fn test_oversized_used_file_size_is_corruption_and_rebuilds() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);
    for uid in [3, 7, 9] {
        index.append_record(uid);
    }

    {
        let mut tree = UidTree::create(&index, small_config()).expect("create");
        assert_eq!(tree.record_count(), 3);
        tree.sync_file(&index).expect("sync");
    }

    // claim more bytes in use than the file has
    patch_file(&dir, 8, &u64::MAX.to_ne_bytes());

    let mut tree = UidTree::open_or_create(&index, small_config()).expect("rebuild");
    assert!(index.inconsistent(), "corruption must mark the index");
    assert!(
        index
            .last_error()
            .expect("error recorded")
            .contains("Corrupted binary tree file"),
    );
    assert_eq!(tree.record_count(), 3);
    assert_eq!(tree.lookup(&index, 7).expect("lookup"), Some(1));
}

#[test]
fn test_indexid_mismatch_is_corruption_and_rebuilds() {
    let dir = TempDir::new().expect("tempdir");
    {
        let index = file_index(&dir, 0xaaaa_0001);
        let mut tree = UidTree::create(&index, small_config()).expect("create");
        tree.insert(&index, 1, 0).expect("insert");
        tree.sync_file(&index).expect("sync");
    }

    // same path, different index identity
    let other = file_index(&dir, 0xbbbb_0002);
    other.append_record(8);
    let mut tree = UidTree::open_or_create(&other, small_config()).expect("rebuild");

    assert!(other.inconsistent());
    assert_eq!(tree.lookup(&other, 1).expect("lookup"), None);
    assert_eq!(tree.lookup(&other, 8).expect("lookup"), Some(0));
}

#[test]
fn test_trailing_partial_node_is_repaired_without_data_loss() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    {
        let mut tree = UidTree::create(&index, small_config()).expect("create");
        for uid in 1..=5 {
            tree.insert(&index, uid, uid - 1).expect("insert");
        }
        tree.sync_file(&index).expect("sync");
    }

    // simulate a writer that died after extending the file mid-node
    let old_len = fs::metadata(tree_path(&dir)).expect("metadata").len();
    let file = OpenOptions::new()
        .write(true)
        .open(tree_path(&dir))
        .expect("open");
    file.set_len(old_len + NODE_SIZE as u64 / 2).expect("extend");
    drop(file);

    let mut tree = UidTree::open_or_create(&index, small_config()).expect("repair");
    assert!(!index.inconsistent(), "a partial node is repair, not corruption");
    let repaired_len = fs::metadata(tree_path(&dir)).expect("metadata").len();
    assert_eq!((repaired_len as usize - HEADER_SIZE) % NODE_SIZE, 0);
    for uid in 1..=5 {
        assert_eq!(tree.lookup(&index, uid).expect("lookup"), Some(uid - 1));
    }
}

#[test]
fn test_partial_node_repair_escalates_a_shared_lock() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    {
        let mut tree = UidTree::create(&index, small_config()).expect("create");
        tree.insert(&index, 1, 0).expect("insert");
        tree.sync_file(&index).expect("sync");
    }

    let old_len = fs::metadata(tree_path(&dir)).expect("metadata").len();
    let file = OpenOptions::new()
        .write(true)
        .open(tree_path(&dir))
        .expect("open");
    file.set_len(old_len + 3).expect("extend");
    drop(file);

    // under a shared lock the repair is refused, the lock escalated, and
    // the open retried — data intact, no rebuild
    index.set_lock(LockType::Shared).expect("lock");
    let mut tree = UidTree::open_or_create(&index, small_config()).expect("repair");
    assert_eq!(index.lock_type(), LockType::Exclusive);
    assert!(!index.inconsistent());
    assert_eq!(tree.lookup(&index, 1).expect("lookup"), Some(0));
}

// ---------------------------------------------------------------------------
// Cross-handle coherence
// ---------------------------------------------------------------------------

#[test]
fn test_second_handle_observes_growth_through_sync_id() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    let mut writer = UidTree::create(&index, small_config()).expect("create");
    index.set_lock(LockType::Shared).expect("lock");
    let mut reader = UidTree::open_or_create(&index, small_config()).expect("open");
    let reader_initial_map = reader.mapped_file_size();

    // grow through the writer: min_records=8 caps the store at 7 data
    // nodes, so 20 inserts force at least one grow + sync_id bump
    index.set_lock(LockType::Exclusive).expect("lock");
    for uid in 1..=20 {
        writer.insert(&index, uid, uid).expect("insert");
    }
    writer.sync_file(&index).expect("sync");
    assert!(writer.sync_id() > 0);

    index.set_lock(LockType::Shared).expect("lock");
    assert_eq!(reader.lookup(&index, 20).expect("lookup"), Some(20));
    assert!(reader.mapped_file_size() > reader_initial_map);
    assert_eq!(reader.sync_id(), writer.sync_id());
    assert!(reader.used_file_size() <= reader.mapped_file_size());
}

#[test]
fn test_lookup_is_idempotent_on_the_mapping() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    let mut tree = UidTree::create(&index, small_config()).expect("create");
    tree.insert(&index, 1, 0).expect("insert");

    index.set_lock(LockType::Shared).expect("lock");
    let _ = tree.lookup(&index, 1).expect("lookup");
    let sync_id = tree.sync_id();
    let mapped = tree.mapped_file_size();
    let used = tree.used_file_size();

    let _ = tree.lookup(&index, 1).expect("lookup");
    assert_eq!(tree.sync_id(), sync_id);
    assert_eq!(tree.mapped_file_size(), mapped);
    assert_eq!(tree.used_file_size(), used);
}

#[test]
fn test_reader_survives_unlink_and_rebuild() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);
    index.append_record(1);

    let mut reader = UidTree::create(&index, small_config()).expect("create");
    assert_eq!(reader.lookup(&index, 1).expect("lookup"), Some(0));

    // another opener finds a foreign indexid, unlinks and rebuilds; the
    // reader's own view of the old inode is untouched
    patch_file(&dir, 0, &0xdead_beef_u32.to_ne_bytes());
    let mut rebuilt = UidTree::open_or_create(&index, small_config()).expect("rebuild");
    assert_eq!(rebuilt.lookup(&index, 1).expect("lookup"), Some(0));

    // the first handle still reads through its mapping of the old inode
    assert_eq!(reader.lookup(&index, 1).expect("lookup"), Some(0));
}

// ---------------------------------------------------------------------------
// Flush bookkeeping
// ---------------------------------------------------------------------------

#[test]
fn test_sync_file_exposes_descriptor_once() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    let mut tree = UidTree::create(&index, small_config()).expect("create");
    tree.insert(&index, 1, 0).expect("insert");
    assert!(tree.is_modified());

    assert!(tree.sync_file(&index).expect("sync").is_some());
    assert!(!tree.is_modified());
    assert!(
        tree.sync_file(&index).expect("sync").is_none(),
        "a clean tree has nothing to expose for fsync"
    );
}

#[test]
fn test_anonymous_tree_never_reports_a_descriptor() {
    let index = MemoryIndex::new(0x2222);
    index.set_lock(LockType::Exclusive).expect("lock");

    let mut tree = UidTree::create(&index, small_config()).expect("create");
    tree.insert(&index, 1, 0).expect("insert");
    assert!(tree.sync_file(&index).expect("sync").is_none());
}

#[test]
fn test_invalidating_flush_path_stays_coherent() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);
    index.set_mmap_invalidate(true);

    let mut tree = UidTree::create(&index, small_config()).expect("create");
    for uid in 1..=10 {
        tree.insert(&index, uid, uid).expect("insert");
    }
    for uid in 1..=10 {
        assert_eq!(tree.lookup(&index, uid).expect("lookup"), Some(uid));
    }
}

#[test]
fn test_close_releases_mapping_and_descriptor() {
    let dir = TempDir::new().expect("tempdir");
    let index = file_index(&dir, 0x1111);

    let mut tree = UidTree::create(&index, small_config()).expect("create");
    tree.insert(&index, 1, 0).expect("insert");
    tree.close();
    assert_eq!(tree.record_count(), 0);
    assert_eq!(tree.mapped_file_size(), 0);
}
