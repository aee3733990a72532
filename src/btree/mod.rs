//! # B+Tree
//!
//! Persistent ordered map from opaque key bytes to opaque value bytes. All
//! entries live in leaf nodes; internal nodes hold separator keys and child
//! page ids. Leaves form a doubly-linked chain for range scans.
//!
//! ```text
//!                  [Internal]
//!                 /     |     \
//!         [Leaf A] <-> [Leaf B] <-> [Leaf C]
//! ```
//!
//! Each node occupies one index page. Node capacity is bounded twice over:
//! a fan-out ceiling of `ORDER` keys, and a byte ceiling on the serialized
//! form so any node always fits its page. Splits trigger at 3/4 of the byte
//! ceiling, which leaves room for the in-flight entry.
//!
//! Keys order lexicographically over raw bytes with shorter-prefix-first
//! ties, which is exactly slice `Ord`. Unique trees reject duplicate keys;
//! non-unique trees take duplicates as inserted (callers make keys distinct
//! with a suffix).

mod node;
mod tree;

pub use node::{Node, NODE_HEADER_SIZE, NODE_MAX_BYTES};
pub use tree::BTree;

/// Fan-out ceiling: no node holds more than `ORDER - 1` keys.
pub const ORDER: usize = 50;

/// Nodes below this key count borrow or merge after a delete.
pub const MIN_KEYS: usize = (ORDER - 1) / 2;

/// Split when an insertion would push the serialized node past this.
pub const SPLIT_THRESHOLD: usize = NODE_MAX_BYTES * 3 / 4;

/// Longest accepted key: a quarter of the page data area.
pub const MAX_KEY_LEN: usize = crate::storage::PAGE_DATA_SIZE / 4;

/// Longest accepted value.
pub const MAX_VALUE_LEN: usize = 256;
