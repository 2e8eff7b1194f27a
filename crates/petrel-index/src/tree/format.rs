//! On-disk layout of the binary tree file.
//!
//! The file is a fixed header followed by a contiguous array of fixed-size
//! nodes:
//!
//! ```text
//! [indexid: u32] [sync_id: u32] [used_file_size: u64]     -- header, 16 bytes
//! [node 0: sentinel] [node 1] [node 2] ...                -- 20 bytes each
//! ```
//!
//! Node layout: `[uid: u32] [value: u32] [left: u32] [right: u32] [up: u32]`
//! with the red/black color packed into the top bit of `up`. All fields are
//! host-endian: the file lives next to its record index and is never moved
//! across machines, and a rebuild is cheaper than a portable codec.
//!
//! Node 0 is the sentinel — the red/black null. It is always allocated,
//! always black and never freed. Its `left` field holds the root node index
//! (0 for an empty tree) so rotations and transplants at the root need no
//! special case, and its `up` field is scratch space for delete fixups.

/// Size of the persisted tree header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Size of one persisted tree node in bytes.
pub const NODE_SIZE: usize = 20;

/// Sentinel node index: the logical null child and leaf-parent placeholder.
pub(crate) const NIL: u32 = 0;

/// Color flag packed into the top bit of a node's `up` field.
const COLOR_BIT: u32 = 1 << 31;

/// Node color. Freshly inserted nodes are red; the sentinel is black.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Color {
    /// Counts toward the black-height of every path through the node.
    #[default]
    Black,
    /// Must not have a red parent.
    Red,
}

/// Persisted tree header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    /// Identity token copied from the owning record index at creation.
    pub indexid: u32,
    /// Bumped on every change to the total file size. Assumed never to
    /// wrap: one bump per grow/truncate cannot exhaust a u32 within any
    /// plausible mailbox lifetime.
    pub sync_id: u32,
    /// Bytes logically in use, header included.
    pub used_file_size: u64,
}

impl TreeHeader {
    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn read(buf: &[u8]) -> Self {
        assert!(buf.len() >= HEADER_SIZE, "header read out of bounds");
        Self {
            indexid: u32::from_ne_bytes(buf[0..4].try_into().expect("4-byte field")),
            sync_id: u32::from_ne_bytes(buf[4..8].try_into().expect("4-byte field")),
            used_file_size: u64::from_ne_bytes(buf[8..16].try_into().expect("8-byte field")),
        }
    }

    /// Encodes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_SIZE, "header write out of bounds");
        buf[0..4].copy_from_slice(&self.indexid.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.sync_id.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.used_file_size.to_ne_bytes());
    }
}

/// One tree node, decoded. Node slots are addressed by 1-based index with
/// slot 0 reserved for the sentinel; an all-zero node is a valid black
/// sentinel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TreeNode {
    /// Message UID, the search key.
    pub uid: u32,
    /// Record position in the owning record index.
    pub value: u32,
    /// Left child node index, [`NIL`] for none.
    pub left: u32,
    /// Right child node index, [`NIL`] for none.
    pub right: u32,
    /// Parent node index, [`NIL`] for the root.
    pub up: u32,
    pub color: Color,
}

impl TreeNode {
    /// Decodes a node from the first [`NODE_SIZE`] bytes of `buf`.
    pub fn read(buf: &[u8]) -> Self {
        assert!(buf.len() >= NODE_SIZE, "node read out of bounds");
        let up = u32::from_ne_bytes(buf[16..20].try_into().expect("4-byte field"));
        Self {
            uid: u32::from_ne_bytes(buf[0..4].try_into().expect("4-byte field")),
            value: u32::from_ne_bytes(buf[4..8].try_into().expect("4-byte field")),
            left: u32::from_ne_bytes(buf[8..12].try_into().expect("4-byte field")),
            right: u32::from_ne_bytes(buf[12..16].try_into().expect("4-byte field")),
            up: up & !COLOR_BIT,
            color: if up & COLOR_BIT == 0 {
                Color::Black
            } else {
                Color::Red
            },
        }
    }

    /// Encodes the node into the first [`NODE_SIZE`] bytes of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= NODE_SIZE, "node write out of bounds");
        assert!(self.up < COLOR_BIT, "node index overflows the color bit");
        let up = match self.color {
            Color::Black => self.up,
            Color::Red => self.up | COLOR_BIT,
        };
        buf[0..4].copy_from_slice(&self.uid.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.value.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.left.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.right.to_ne_bytes());
        buf[16..20].copy_from_slice(&up.to_ne_bytes());
    }
}

/// Tuning knobs for the tree file's sizing policy.
///
/// The defaults match long-standing mail index practice; tests shrink
/// `min_records` to hit the growth and truncation thresholds with small
/// mailboxes.
#[derive(Clone, Copy, Debug)]
pub struct TreeConfig {
    /// Minimum node capacity the file is ever sized for (sentinel
    /// included).
    pub min_records: u32,
    /// Growth step as a percentage of the owning index's message count,
    /// with a floor of 16 nodes.
    pub grow_percentage: u32,
    /// Truncate when free space exceeds this percentage of the file.
    pub truncate_percentage: u32,
    /// Portion of the free space kept as headroom when truncating.
    pub truncate_keep_percentage: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            min_records: 64,
            grow_percentage: 10,
            truncate_percentage: 50,
            truncate_keep_percentage: 10,
        }
    }
}

impl TreeConfig {
    /// Minimum file size: header plus `min_records` node slots.
    #[must_use]
    pub fn min_size(&self) -> usize {
        HEADER_SIZE + self.min_records as usize * NODE_SIZE
    }
}
