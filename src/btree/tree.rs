//! # B+Tree Operations
//!
//! Insert, search, range scan, and delete over pager-backed nodes.
//!
//! ## Insert
//!
//! Descent is preemptive: a child that is full (by fan-out or by serialized
//! bytes) is split before descending into it, so the recursion never has to
//! propagate splits back up. When the root itself is full a new internal
//! root is allocated above it first.
//!
//! Splits pick a byte-driven midpoint: the first index where the cumulative
//! serialized entry size reaches half the node total, clamped away from the
//! edges. Leaf splits copy the midpoint key up; internal splits move it up.
//! The leaf chain is stitched around the new right node.
//!
//! ## Delete
//!
//! After removing from a leaf, underflowing nodes (fewer than `MIN_KEYS`
//! keys) are repaired on the way back up: borrow from a richer left
//! sibling, else a richer right sibling, else merge with a neighbor and
//! pull the separator down. A merge or borrow that would push the surviving
//! node past the byte ceiling is skipped; the node stays under-full, which
//! is valid, just not tidy. A root left as an empty internal node collapses
//! onto its only child (the old root page stays allocated; callers can
//! reclaim it).

use eyre::{bail, ensure, Result, WrapErr};

use super::node::Node;
use super::{MAX_KEY_LEN, MAX_VALUE_LEN, MIN_KEYS, NODE_MAX_BYTES, ORDER, SPLIT_THRESHOLD};
use crate::error::DbError;
use crate::storage::{Page, PageType, Pager};

pub struct BTree<'p> {
    pager: &'p mut Pager,
    root_page: u32,
    unique: bool,
}

impl<'p> BTree<'p> {
    /// Opens an existing tree rooted at `root_page`.
    pub fn open(pager: &'p mut Pager, root_page: u32, unique: bool) -> Result<Self> {
        ensure!(
            root_page < pager.page_count(),
            DbError::NotFound(format!("tree root page {} beyond file", root_page))
        );
        Ok(Self {
            pager,
            root_page,
            unique,
        })
    }

    /// Allocates a new tree: a single empty leaf as the root.
    pub fn create(pager: &'p mut Pager, unique: bool) -> Result<Self> {
        let page = pager.allocate_page(PageType::Index)?;
        let root_page = page.id();
        let mut tree = Self {
            pager,
            root_page,
            unique,
        };
        tree.store(&Node::new_leaf(root_page))?;
        Ok(tree)
    }

    /// Current root page id. Callers persist this; splits and root collapse
    /// move it.
    pub fn root_page(&self) -> u32 {
        self.root_page
    }

    fn load(&mut self, page_id: u32) -> Result<Node> {
        let page = self.pager.read_page(page_id)?;
        Node::load_from(&page)
    }

    fn store(&mut self, node: &Node) -> Result<()> {
        let mut page = Page::new(node.page_id, PageType::Index);
        node.store_into(&mut page)?;
        self.pager.write_page(&page)
    }

    fn needs_split(node: &Node, incoming: usize) -> bool {
        node.key_count() >= ORDER - 1 || node.serialized_size() + incoming > SPLIT_THRESHOLD
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        ensure!(
            key.len() <= MAX_KEY_LEN,
            DbError::InvalidArgument(format!(
                "index key of {} bytes exceeds limit {}",
                key.len(),
                MAX_KEY_LEN
            ))
        );
        ensure!(
            value.len() <= MAX_VALUE_LEN,
            DbError::InvalidArgument(format!(
                "index value of {} bytes exceeds limit {}",
                value.len(),
                MAX_VALUE_LEN
            ))
        );

        let root = self.load(self.root_page)?;
        let incoming = if root.is_leaf {
            Node::leaf_entry_size(key, value)
        } else {
            Node::internal_entry_size(key)
        };

        if Self::needs_split(&root, incoming) {
            let page = self.pager.allocate_page(PageType::Index)?;
            let mut new_root = Node::new_internal(page.id());
            new_root.children.push(root.page_id);
            self.split_child(&mut new_root, 0)?;
            self.root_page = new_root.page_id;
            self.insert_non_full(new_root, key, value)
        } else {
            self.insert_non_full(root, key, value)
        }
    }

    fn insert_non_full(&mut self, mut node: Node, key: &[u8], value: &[u8]) -> Result<()> {
        if node.is_leaf {
            // Linear scan with early exit; duplicates sit adjacent, new
            // entries go after any equal run.
            let mut idx = node.keys.len();
            for (i, existing) in node.keys.iter().enumerate() {
                match existing.as_slice().cmp(key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => {
                        if self.unique {
                            bail!(DbError::DuplicateKey);
                        }
                        continue;
                    }
                    std::cmp::Ordering::Greater => {
                        idx = i;
                        break;
                    }
                }
            }
            node.keys.insert(idx, key.to_vec());
            node.values.insert(idx, value.to_vec());
            return self.store(&node);
        }

        let mut idx = node.keys.partition_point(|k| k.as_slice() <= key);
        let child = self.load(node.children[idx])?;
        let incoming = if child.is_leaf {
            Node::leaf_entry_size(key, value)
        } else {
            Node::internal_entry_size(key)
        };

        if Self::needs_split(&child, incoming) {
            self.split_child(&mut node, idx)?;
            if key >= node.keys[idx].as_slice() {
                idx += 1;
            }
            let child = self.load(node.children[idx])?;
            self.insert_non_full(child, key, value)
        } else {
            self.insert_non_full(child, key, value)
        }
    }

    /// Splits `parent.children[idx]`, inserting the promoted separator into
    /// the parent. Stores the child, the new right node, the parent, and
    /// the right neighbor whose back-link moves.
    fn split_child(&mut self, parent: &mut Node, idx: usize) -> Result<()> {
        let mut child = self.load(parent.children[idx])?;
        let mid = split_point(&child);

        // The promoted separator is the midpoint key in both variants.
        // Refuse before mutating anything if it cannot fit the parent.
        ensure!(
            parent.serialized_size() + Node::internal_entry_size(&child.keys[mid])
                <= NODE_MAX_BYTES,
            "separator from splitting page {} would overflow its parent",
            child.page_id
        );

        let right_page = self.pager.allocate_page(PageType::Index)?;
        let promoted;
        let mut right;

        if child.is_leaf {
            right = Node::new_leaf(right_page.id());
            right.keys = child.keys.split_off(mid);
            right.values = child.values.split_off(mid);
            promoted = right.keys[0].clone();

            right.next = child.next;
            right.prev = child.page_id;
            if child.next != 0 {
                let mut old_next = self.load(child.next)?;
                old_next.prev = right.page_id;
                self.store(&old_next)?;
            }
            child.next = right.page_id;
        } else {
            right = Node::new_internal(right_page.id());
            let mut upper = child.keys.split_off(mid);
            promoted = upper.remove(0);
            right.keys = upper;
            right.children = child.children.split_off(mid + 1);
        }

        parent.keys.insert(idx, promoted);
        parent.children.insert(idx + 1, right.page_id);

        // Parent first: its serialization is the only store that can be
        // refused, and a refused parent must leave the old child intact.
        self.store(parent)?;
        self.store(&child)?;
        self.store(&right)
    }

    pub fn search(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut node = self.load(self.root_page)?;
        loop {
            if node.is_leaf {
                for (i, existing) in node.keys.iter().enumerate() {
                    match existing.as_slice().cmp(key) {
                        std::cmp::Ordering::Less => continue,
                        std::cmp::Ordering::Equal => return Ok(Some(node.values[i].clone())),
                        std::cmp::Ordering::Greater => return Ok(None),
                    }
                }
                return Ok(None);
            }
            let idx = node.keys.partition_point(|k| k.as_slice() <= key);
            node = self.load(node.children[idx])?;
        }
    }

    /// Walks the leaf chain emitting entries with keys inside the bounds.
    /// `None` bounds are open; inclusivity applies per bound.
    pub fn range(
        &mut self,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
        min_inclusive: bool,
        max_inclusive: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut results = Vec::new();
        let cap = limit.unwrap_or(usize::MAX);
        if cap == 0 {
            return Ok(results);
        }

        // Descend toward the lower bound, or the leftmost leaf.
        let mut node = self.load(self.root_page)?;
        while !node.is_leaf {
            let idx = match min {
                Some(bound) => node.keys.partition_point(|k| k.as_slice() <= bound),
                None => 0,
            };
            node = self.load(node.children[idx])?;
        }

        loop {
            for (i, key) in node.keys.iter().enumerate() {
                if let Some(bound) = min {
                    let below = if min_inclusive {
                        key.as_slice() < bound
                    } else {
                        key.as_slice() <= bound
                    };
                    if below {
                        continue;
                    }
                }
                if let Some(bound) = max {
                    let past = if max_inclusive {
                        key.as_slice() > bound
                    } else {
                        key.as_slice() >= bound
                    };
                    if past {
                        return Ok(results);
                    }
                }
                results.push((key.clone(), node.values[i].clone()));
                if results.len() >= cap {
                    return Ok(results);
                }
            }
            if node.next == 0 {
                return Ok(results);
            }
            node = self.load(node.next)?;
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let removed = self.delete_rec(self.root_page, key)?;
        if removed {
            let root = self.load(self.root_page)?;
            if !root.is_leaf && root.keys.is_empty() {
                // Collapse onto the only child; the old root page stays
                // allocated for the caller to reclaim.
                self.root_page = root.children[0];
            }
        }
        Ok(removed)
    }

    fn delete_rec(&mut self, page_id: u32, key: &[u8]) -> Result<bool> {
        let mut node = self.load(page_id)?;
        if node.is_leaf {
            let mut found = None;
            for (i, existing) in node.keys.iter().enumerate() {
                match existing.as_slice().cmp(key) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => {
                        found = Some(i);
                        break;
                    }
                    std::cmp::Ordering::Greater => break,
                }
            }
            let Some(i) = found else {
                return Ok(false);
            };
            node.keys.remove(i);
            node.values.remove(i);
            self.store(&node)?;
            return Ok(true);
        }

        let idx = node.keys.partition_point(|k| k.as_slice() <= key);
        let removed = self.delete_rec(node.children[idx], key)?;
        if removed {
            let child = self.load(node.children[idx])?;
            if child.key_count() < MIN_KEYS {
                self.fix_underflow(&mut node, idx)?;
                self.store(&node)?;
            }
        }
        Ok(removed)
    }

    /// Repairs `parent.children[idx]` after it dropped below `MIN_KEYS`:
    /// borrow left, borrow right, else merge.
    fn fix_underflow(&mut self, parent: &mut Node, idx: usize) -> Result<()> {
        let mut child = self.load(parent.children[idx])?;

        if idx > 0 {
            let mut left = self.load(parent.children[idx - 1])?;
            let incoming = if child.is_leaf {
                Node::leaf_entry_size(
                    left.keys.last().map_or(&[][..], |k| k),
                    left.values.last().map_or(&[][..], |v| v),
                )
            } else {
                Node::internal_entry_size(&parent.keys[idx - 1])
            };
            if left.key_count() > MIN_KEYS
                && child.serialized_size() + incoming <= NODE_MAX_BYTES
            {
                if child.is_leaf {
                    let key = left.keys.pop().unwrap();
                    let value = left.values.pop().unwrap();
                    child.keys.insert(0, key);
                    child.values.insert(0, value);
                    parent.keys[idx - 1] = child.keys[0].clone();
                } else {
                    let separator =
                        std::mem::replace(&mut parent.keys[idx - 1], left.keys.pop().unwrap());
                    child.keys.insert(0, separator);
                    child.children.insert(0, left.children.pop().unwrap());
                }
                self.store(&left)?;
                return self.store(&child);
            }
        }

        if idx + 1 < parent.children.len() {
            let mut right = self.load(parent.children[idx + 1])?;
            let incoming = if child.is_leaf {
                Node::leaf_entry_size(
                    right.keys.first().map_or(&[][..], |k| k),
                    right.values.first().map_or(&[][..], |v| v),
                )
            } else {
                Node::internal_entry_size(&parent.keys[idx])
            };
            if right.key_count() > MIN_KEYS
                && child.serialized_size() + incoming <= NODE_MAX_BYTES
            {
                if child.is_leaf {
                    let key = right.keys.remove(0);
                    let value = right.values.remove(0);
                    child.keys.push(key);
                    child.values.push(value);
                    parent.keys[idx] = right.keys[0].clone();
                } else {
                    let separator =
                        std::mem::replace(&mut parent.keys[idx], right.keys.remove(0));
                    child.keys.push(separator);
                    child.children.push(right.children.remove(0));
                }
                self.store(&right)?;
                return self.store(&child);
            }
        }

        if idx > 0 {
            self.merge_children(parent, idx - 1)
        } else if idx + 1 < parent.children.len() {
            self.merge_children(parent, idx)
        } else {
            Ok(())
        }
    }

    /// Merges `parent.children[left_idx + 1]` into its left neighbor,
    /// pulling the separator down for internal nodes. Skipped when the
    /// survivor would exceed the node byte ceiling.
    fn merge_children(&mut self, parent: &mut Node, left_idx: usize) -> Result<()> {
        let mut left = self.load(parent.children[left_idx])?;
        let right = self.load(parent.children[left_idx + 1])?;

        let mut combined =
            left.serialized_size() + right.serialized_size() - super::NODE_HEADER_SIZE;
        if !left.is_leaf {
            combined += 2 + parent.keys[left_idx].len();
        }
        if combined > NODE_MAX_BYTES {
            return Ok(());
        }

        if left.is_leaf {
            left.keys.extend(right.keys);
            left.values.extend(right.values);
            left.next = right.next;
            if right.next != 0 {
                let mut neighbor = self.load(right.next)?;
                neighbor.prev = left.page_id;
                self.store(&neighbor)?;
            }
        } else {
            left.keys.push(parent.keys[left_idx].clone());
            left.keys.extend(right.keys);
            left.children.extend(right.children);
        }

        parent.keys.remove(left_idx);
        parent.children.remove(left_idx + 1);

        self.store(&left)?;
        self.pager
            .free_page(right.page_id)
            .wrap_err("freeing merged-away tree page")
    }

    /// Frees every page of the tree. Consumes the handle.
    pub fn destroy(self) -> Result<()> {
        let mut stack = vec![self.root_page];
        let mut pages = Vec::new();
        while let Some(page_id) = stack.pop() {
            let page = self.pager.read_page(page_id)?;
            let node = Node::load_from(&page)?;
            if !node.is_leaf {
                stack.extend(node.children.iter().copied());
            }
            pages.push(page_id);
        }
        for page_id in pages {
            self.pager.free_page(page_id)?;
        }
        Ok(())
    }

    /// Structural self-check: in-node ordering, parent-propagated bounds,
    /// child counts, uniform depth, and leaf-chain consistency.
    pub fn verify(&mut self) -> Result<()> {
        let mut leaves = Vec::new();
        self.verify_node(self.root_page, None, None, &mut leaves)?;

        if let Some(first) = leaves.first() {
            ensure!(
                first.prev == 0,
                "leftmost leaf {} has prev {}",
                first.page_id,
                first.prev
            );
        }
        if let Some(last) = leaves.last() {
            ensure!(
                last.next == 0,
                "rightmost leaf {} has next {}",
                last.page_id,
                last.next
            );
        }
        for pair in leaves.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            ensure!(
                a.next == b.page_id,
                "leaf {} next {} skips leaf {}",
                a.page_id,
                a.next,
                b.page_id
            );
            ensure!(
                b.prev == a.page_id,
                "leaf {} prev {} is not leaf {}",
                b.page_id,
                b.prev,
                a.page_id
            );
            if let (Some(last_key), Some(first_key)) = (a.keys.last(), b.keys.first()) {
                ensure!(
                    last_key < first_key,
                    "leaf {} last key is not below leaf {} first key",
                    a.page_id,
                    b.page_id
                );
            }
        }
        Ok(())
    }

    fn verify_node(
        &mut self,
        page_id: u32,
        min: Option<&[u8]>,
        max: Option<&[u8]>,
        leaves: &mut Vec<Node>,
    ) -> Result<usize> {
        let node = self.load(page_id)?;

        for pair in node.keys.windows(2) {
            ensure!(
                pair[0] < pair[1],
                "keys out of order in node {}",
                page_id
            );
        }
        for key in &node.keys {
            if let Some(bound) = min {
                ensure!(
                    key.as_slice() >= bound,
                    "key below propagated lower bound in node {}",
                    page_id
                );
            }
            if let Some(bound) = max {
                ensure!(
                    key.as_slice() < bound,
                    "key at or above propagated upper bound in node {}",
                    page_id
                );
            }
        }

        if node.is_leaf {
            ensure!(
                node.values.len() == node.keys.len(),
                "leaf {} has {} values for {} keys",
                page_id,
                node.values.len(),
                node.keys.len()
            );
            leaves.push(node);
            return Ok(1);
        }

        ensure!(
            node.children.len() == node.keys.len() + 1,
            "internal node {} has {} children for {} keys",
            page_id,
            node.children.len(),
            node.keys.len()
        );

        let mut depth = None;
        for (i, &child) in node.children.iter().enumerate() {
            let child_min = if i == 0 {
                min
            } else {
                Some(node.keys[i - 1].as_slice())
            };
            let child_max = if i == node.keys.len() {
                max
            } else {
                Some(node.keys[i].as_slice())
            };
            let child_depth = self.verify_node(child, child_min, child_max, leaves)?;
            match depth {
                None => depth = Some(child_depth),
                Some(expected) => ensure!(
                    child_depth == expected,
                    "uneven subtree depth under node {}",
                    page_id
                ),
            }
        }
        Ok(depth.unwrap_or(0) + 1)
    }
}

/// Byte-driven midpoint: first index where the cumulative entry size
/// reaches half the node total, clamped inside (0, key_count).
fn split_point(node: &Node) -> usize {
    let count = node.key_count();
    debug_assert!(count >= 2, "splitting a node with {} keys", count);

    let entry = |i: usize| -> usize {
        if node.is_leaf {
            Node::leaf_entry_size(&node.keys[i], &node.values[i])
        } else {
            Node::internal_entry_size(&node.keys[i])
        }
    };

    let total: usize = (0..count).map(entry).sum();
    let mut cumulative = 0usize;
    for i in 0..count {
        cumulative += entry(i);
        if cumulative * 2 >= total {
            return i.clamp(1, count - 1);
        }
    }
    (count / 2).clamp(1, count - 1)
}
