//! Structural operations: a red/black binary search tree over the node
//! store, keyed by UID.
//!
//! The sentinel at slot 0 plays three roles: the logical null child, the
//! leaf-parent placeholder during delete fixup, and — through its `left`
//! field — the root anchor, which makes rotations and transplants at the
//! root fall out of the generic parent/child surgery.
//!
//! Slots are kept dense: delete moves the tail node into the freed slot
//! and shrinks `used_file_size` by one node, so the size-alignment
//! invariant holds after every mutation and truncation has real space to
//! reclaim.

use crate::error::Result;
use crate::index::{LockType, RecordIndex};

use super::format::{Color, TreeNode, HEADER_SIZE, NODE_SIZE, NIL};
use super::UidTree;

impl UidTree {
    /// Looks up the record position stored for `uid`.
    ///
    /// Requires at least the shared index lock. Revalidates the mapping
    /// first, so a size change by another process is picked up before the
    /// descent.
    pub fn lookup(&mut self, owner: &dyn RecordIndex, uid: u32) -> Result<Option<u32>> {
        assert!(
            owner.lock_type() != LockType::Unlock,
            "tree lookup requires at least the shared index lock"
        );
        self.ensure_current(owner, false)?;

        let mut current = self.root();
        while current != NIL {
            let node = self.node(current);
            if uid < node.uid {
                current = node.left;
            } else if uid > node.uid {
                current = node.right;
            } else {
                return Ok(Some(node.value));
            }
        }
        Ok(None)
    }

    /// Inserts `uid` mapping to `value` (its record position).
    ///
    /// Requires the exclusive index lock; grows the file when the node
    /// store is full. Inserting a UID that is already present is a
    /// programmer error — the record index assigns UIDs monotonically and
    /// never reuses them.
    pub fn insert(&mut self, owner: &dyn RecordIndex, uid: u32, value: u32) -> Result<()> {
        assert_eq!(
            owner.lock_type(),
            LockType::Exclusive,
            "tree insert requires the exclusive index lock"
        );
        self.ensure_current(owner, false)?;

        let count = self.node_count();
        if HEADER_SIZE + (count as usize + 1) * NODE_SIZE > self.full_len {
            self.grow(owner)?;
        }

        // descend to the attach point
        let mut parent = NIL;
        let mut attach_left = true;
        let mut current = self.root();
        while current != NIL {
            let node = self.node(current);
            parent = current;
            if uid < node.uid {
                attach_left = true;
                current = node.left;
            } else {
                assert!(uid != node.uid, "duplicate UID {uid} inserted into tree");
                attach_left = false;
                current = node.right;
            }
        }

        let new = count;
        self.set_node(
            new,
            TreeNode {
                uid,
                value,
                left: NIL,
                right: NIL,
                up: parent,
                color: Color::Red,
            },
        );
        self.set_used_len(self.used_len + NODE_SIZE);

        let mut parent_node = self.node(parent);
        if attach_left {
            parent_node.left = new;
        } else {
            parent_node.right = new;
        }
        self.set_node(parent, parent_node);

        self.insert_fixup(new);
        self.modified = true;
        Ok(())
    }

    /// Deletes `uid` from the tree. Deleting an absent UID is a no-op.
    ///
    /// Requires the exclusive index lock. The freed slot is filled by the
    /// tail node and the file is truncated when enough of it has gone
    /// unused.
    pub fn delete(&mut self, owner: &dyn RecordIndex, uid: u32) -> Result<()> {
        assert_eq!(
            owner.lock_type(),
            LockType::Exclusive,
            "tree delete requires the exclusive index lock"
        );
        self.ensure_current(owner, false)?;

        let mut target = self.root();
        while target != NIL {
            let node = self.node(target);
            if uid < node.uid {
                target = node.left;
            } else if uid > node.uid {
                target = node.right;
            } else {
                break;
            }
        }
        if target == NIL {
            return Ok(());
        }

        let node = self.node(target);
        let unlink = if node.left != NIL && node.right != NIL {
            // interior node: move the in-order successor's payload here and
            // unlink the successor instead, which has no left child
            let mut successor = node.right;
            loop {
                let left = self.node(successor).left;
                if left == NIL {
                    break;
                }
                successor = left;
            }
            let payload = self.node(successor);
            let mut updated = node;
            updated.uid = payload.uid;
            updated.value = payload.value;
            self.set_node(target, updated);
            successor
        } else {
            target
        };

        let gone = self.node(unlink);
        let child = if gone.left != NIL { gone.left } else { gone.right };
        // reparent even when the child is the sentinel: delete fixup uses
        // its scratch `up` to walk back up
        let mut child_node = self.node(child);
        child_node.up = gone.up;
        self.set_node(child, child_node);
        self.replace_child(gone.up, unlink, child);

        if gone.color == Color::Black {
            self.delete_fixup(child);
        }

        self.release_slot(unlink);
        self.modified = true;
        self.truncate(owner)
    }

    /// All `(uid, record position)` pairs in ascending UID order.
    ///
    /// This is the traversal the rebuild verification and the tests use;
    /// the tree offers no further scanning interface.
    pub fn in_order(&mut self, owner: &dyn RecordIndex) -> Result<Vec<(u32, u32)>> {
        assert!(
            owner.lock_type() != LockType::Unlock,
            "tree traversal requires at least the shared index lock"
        );
        self.ensure_current(owner, false)?;

        let mut out = Vec::with_capacity(self.record_count() as usize);
        let mut stack = Vec::new();
        let mut current = self.root();
        while current != NIL || !stack.is_empty() {
            while current != NIL {
                stack.push(current);
                current = self.node(current).left;
            }
            let idx = stack.pop().expect("stack is non-empty");
            let node = self.node(idx);
            out.push((node.uid, node.value));
            current = node.right;
        }
        Ok(out)
    }

    fn root(&self) -> u32 {
        self.node(NIL).left
    }

    /// Swaps `old_child` for `new_child` under `parent`. Works for the
    /// root too: the root lives in the sentinel's `left` slot.
    fn replace_child(&mut self, parent: u32, old_child: u32, new_child: u32) {
        let mut node = self.node(parent);
        if node.left == old_child {
            node.left = new_child;
        } else {
            debug_assert_eq!(node.right, old_child, "broken parent link");
            node.right = new_child;
        }
        self.set_node(parent, node);
    }

    fn set_color(&mut self, idx: u32, color: Color) {
        let mut node = self.node(idx);
        if node.color != color {
            node.color = color;
            self.set_node(idx, node);
        }
    }

    fn rotate_left(&mut self, x: u32) {
        let mut x_node = self.node(x);
        let y = x_node.right;
        debug_assert_ne!(y, NIL, "left rotation needs a right child");
        let mut y_node = self.node(y);

        x_node.right = y_node.left;
        if y_node.left != NIL {
            let mut moved = self.node(y_node.left);
            moved.up = x;
            self.set_node(y_node.left, moved);
        }

        y_node.up = x_node.up;
        self.replace_child(x_node.up, x, y);

        y_node.left = x;
        x_node.up = y;
        self.set_node(x, x_node);
        self.set_node(y, y_node);
    }

    fn rotate_right(&mut self, x: u32) {
        let mut x_node = self.node(x);
        let y = x_node.left;
        debug_assert_ne!(y, NIL, "right rotation needs a left child");
        let mut y_node = self.node(y);

        x_node.left = y_node.right;
        if y_node.right != NIL {
            let mut moved = self.node(y_node.right);
            moved.up = x;
            self.set_node(y_node.right, moved);
        }

        y_node.up = x_node.up;
        self.replace_child(x_node.up, x, y);

        y_node.right = x;
        x_node.up = y;
        self.set_node(x, x_node);
        self.set_node(y, y_node);
    }

    fn insert_fixup(&mut self, mut z: u32) {
        loop {
            let parent = self.node(z).up;
            if self.node(parent).color == Color::Black {
                break;
            }
            // a red parent is never the root, so the grandparent is real
            let grand = self.node(parent).up;
            if parent == self.node(grand).left {
                let uncle = self.node(grand).right;
                if self.node(uncle).color == Color::Red {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(grand, Color::Red);
                    z = grand;
                } else {
                    if z == self.node(parent).right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.node(z).up;
                    let grand = self.node(parent).up;
                    self.set_color(parent, Color::Black);
                    self.set_color(grand, Color::Red);
                    self.rotate_right(grand);
                }
            } else {
                let uncle = self.node(grand).left;
                if self.node(uncle).color == Color::Red {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(grand, Color::Red);
                    z = grand;
                } else {
                    if z == self.node(parent).left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.node(z).up;
                    let grand = self.node(parent).up;
                    self.set_color(parent, Color::Black);
                    self.set_color(grand, Color::Red);
                    self.rotate_left(grand);
                }
            }
        }
        let root = self.root();
        self.set_color(root, Color::Black);
    }

    fn delete_fixup(&mut self, mut x: u32) {
        while x != self.root() && self.node(x).color == Color::Black {
            let parent = self.node(x).up;
            if x == self.node(parent).left {
                let mut sibling = self.node(parent).right;
                if self.node(sibling).color == Color::Red {
                    self.set_color(sibling, Color::Black);
                    self.set_color(parent, Color::Red);
                    self.rotate_left(parent);
                    sibling = self.node(self.node(x).up).right;
                }
                let s_node = self.node(sibling);
                if self.node(s_node.left).color == Color::Black
                    && self.node(s_node.right).color == Color::Black
                {
                    self.set_color(sibling, Color::Red);
                    x = self.node(x).up;
                } else {
                    if self.node(s_node.right).color == Color::Black {
                        self.set_color(s_node.left, Color::Black);
                        self.set_color(sibling, Color::Red);
                        self.rotate_right(sibling);
                        sibling = self.node(self.node(x).up).right;
                    }
                    let parent = self.node(x).up;
                    let parent_color = self.node(parent).color;
                    self.set_color(sibling, parent_color);
                    self.set_color(parent, Color::Black);
                    let sibling_right = self.node(sibling).right;
                    self.set_color(sibling_right, Color::Black);
                    self.rotate_left(parent);
                    x = self.root();
                }
            } else {
                let mut sibling = self.node(parent).left;
                if self.node(sibling).color == Color::Red {
                    self.set_color(sibling, Color::Black);
                    self.set_color(parent, Color::Red);
                    self.rotate_right(parent);
                    sibling = self.node(self.node(x).up).left;
                }
                let s_node = self.node(sibling);
                if self.node(s_node.left).color == Color::Black
                    && self.node(s_node.right).color == Color::Black
                {
                    self.set_color(sibling, Color::Red);
                    x = self.node(x).up;
                } else {
                    if self.node(s_node.left).color == Color::Black {
                        self.set_color(s_node.right, Color::Black);
                        self.set_color(sibling, Color::Red);
                        self.rotate_left(sibling);
                        sibling = self.node(self.node(x).up).left;
                    }
                    let parent = self.node(x).up;
                    let parent_color = self.node(parent).color;
                    self.set_color(sibling, parent_color);
                    self.set_color(parent, Color::Black);
                    let sibling_left = self.node(sibling).left;
                    self.set_color(sibling_left, Color::Black);
                    self.rotate_right(parent);
                    x = self.root();
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Frees a node slot by moving the tail node into it, keeping the
    /// store dense, then shrinks `used_file_size` by one node.
    fn release_slot(&mut self, slot: u32) {
        let tail = self.node_count() - 1;
        debug_assert!(slot >= 1 && slot <= tail, "released slot out of range");

        if slot != tail {
            let moved = self.node(tail);
            self.set_node(slot, moved);
            self.replace_child(moved.up, tail, slot);
            if moved.left != NIL {
                let mut child = self.node(moved.left);
                child.up = slot;
                self.set_node(moved.left, child);
            }
            if moved.right != NIL {
                let mut child = self.node(moved.right);
                child.up = slot;
                self.set_node(moved.right, child);
            }
        }

        self.set_used_len(self.used_len - NODE_SIZE);
    }

    /// Checks every red/black and bookkeeping invariant; test support.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        let sentinel = self.node(NIL);
        assert_eq!(sentinel.color, Color::Black, "sentinel must be black");
        assert_eq!(sentinel.right, NIL, "sentinel right slot must stay empty");

        let root = self.root();
        if root == NIL {
            assert_eq!(self.node_count(), 1, "empty tree must hold only the sentinel");
            return;
        }
        assert_eq!(self.node(root).color, Color::Black, "root must be black");
        assert_eq!(self.node(root).up, NIL, "root parent must be the sentinel");

        let mut visited = 0u32;
        let black_height = self.check_subtree(root, None, None, &mut visited);
        assert!(black_height >= 1);
        assert_eq!(
            visited,
            self.node_count() - 1,
            "tree must reach every allocated node exactly once"
        );
    }

    #[cfg(test)]
    fn check_subtree(
        &self,
        idx: u32,
        min_uid: Option<u32>,
        max_uid: Option<u32>,
        visited: &mut u32,
    ) -> u32 {
        if idx == NIL {
            return 1;
        }
        *visited += 1;
        assert!(*visited <= self.node_count(), "cycle in tree structure");

        let node = self.node(idx);
        if let Some(min) = min_uid {
            assert!(node.uid > min, "UID ordering violated");
        }
        if let Some(max) = max_uid {
            assert!(node.uid < max, "UID ordering violated");
        }
        if node.color == Color::Red {
            assert_eq!(
                self.node(node.left).color,
                Color::Black,
                "red node with red left child"
            );
            assert_eq!(
                self.node(node.right).color,
                Color::Black,
                "red node with red right child"
            );
        }
        for child in [node.left, node.right] {
            if child != NIL {
                assert_eq!(self.node(child).up, idx, "broken parent link");
            }
        }

        let left_height = self.check_subtree(node.left, min_uid, Some(node.uid), visited);
        let right_height = self.check_subtree(node.right, Some(node.uid), max_uid, visited);
        assert_eq!(left_height, right_height, "unequal black heights");
        left_height + u32::from(node.color == Color::Black)
    }
}
