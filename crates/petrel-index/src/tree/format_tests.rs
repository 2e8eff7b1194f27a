//! Codec tests for the persisted header and node layouts.

use super::format::{Color, TreeConfig, TreeHeader, TreeNode, HEADER_SIZE, NODE_SIZE};

#[test]
fn test_header_round_trip() {
    let header = TreeHeader {
        indexid: 0x1234_5678,
        sync_id: 42,
        used_file_size: 0xdead_beef_u64,
    };
    let mut buf = [0u8; HEADER_SIZE];
    header.write(&mut buf);
    assert_eq!(TreeHeader::read(&buf), header);
}

#[test]
fn test_node_round_trip_keeps_color() {
    let red = TreeNode {
        uid: 7,
        value: 3,
        left: 1,
        right: 2,
        up: 5,
        color: Color::Red,
    };
    let mut buf = [0u8; NODE_SIZE];
    red.write(&mut buf);
    assert_eq!(TreeNode::read(&buf), red);

    let black = TreeNode {
        color: Color::Black,
        ..red
    };
    black.write(&mut buf);
    assert_eq!(TreeNode::read(&buf), black);
}

#[test]
fn test_zeroed_node_is_black_sentinel() {
    let node = TreeNode::read(&[0u8; NODE_SIZE]);
    assert_eq!(node, TreeNode::default());
    assert_eq!(node.color, Color::Black);
    assert_eq!(node.left, 0);
}

#[test]
#[should_panic(expected = "color bit")]
fn test_node_index_overflowing_color_bit_panics() {
    let node = TreeNode {
        up: 1 << 31,
        ..TreeNode::default()
    };
    let mut buf = [0u8; NODE_SIZE];
    node.write(&mut buf);
}

#[test]
fn test_min_size_is_node_aligned() {
    let cfg = TreeConfig::default();
    assert_eq!(cfg.min_records, 64);
    assert_eq!(cfg.min_size(), HEADER_SIZE + 64 * NODE_SIZE);
    assert_eq!((cfg.min_size() - HEADER_SIZE) % NODE_SIZE, 0);

    let small = TreeConfig {
        min_records: 4,
        ..TreeConfig::default()
    };
    assert_eq!(small.min_size(), HEADER_SIZE + 4 * NODE_SIZE);
}
