//! Node-level engine of a versioned, radix-16 sparse Merkle tree.
//!
//! Each [`TreeNode`] packs four binary levels (16 children) into a single
//! cache-friendly node: a 14-slot internal hash cache plus an append-only
//! ledger of `(version, root hash)` pairs. On top of that the node exposes
//! three recompute strategies:
//!
//! * a sequential single-child update ([`TreeNode::set_children`]),
//! * a parallel batch recompute over a worker pool
//!   ([`TreeNode::compute_internal`]),
//! * a lock-minimized cooperative protocol that lets concurrent sibling
//!   updates finish each other's hash chains ([`TreeNode::recompute`]).
//!
//! Tree traversal, the backing store and proof assembly live in the layers
//! above; this crate only defines the capabilities it consumes from them
//! ([`NodeHasher`], [`NilHashes`], [`SiblingJournal`]).

mod error;
mod hasher;
mod internals;
mod journal;
mod nil_hashes;
mod storage;
mod threadpool;
mod tree_node;
mod version;

use ethereum_types::H256;

pub use self::error::SmtError;
pub use self::hasher::{Keccak256Hasher, NodeHasher};
pub use self::internals::{INTERNAL_COUNT, LEAF_INTERNAL_MAP, NIBBLE_COUNT};
pub use self::journal::{Journal, JournalKey, SiblingJournal};
pub use self::nil_hashes::NilHashes;
pub use self::storage::{StorageLeafNode, StorageTreeNode};
pub use self::threadpool::ThreadPool;
pub use self::tree_node::TreeNode;
pub use self::version::{Version, VersionInfo, VersionLedger};

/// Width of every hash handled by this crate.
pub const HASH_SIZE: usize = 32;
/// Persisted width of one ledger entry: an 8-byte version plus a 32-byte hash.
pub const VERSION_SIZE: usize = 40;

/// Ordered sibling hashes from a leaf up to the root, sufficient for
/// independent verification by repeated combining. Assembled by the tree
/// traversal layer from [`TreeNode::root`] and [`TreeNode::internal_hash`].
pub type Proof = Vec<H256>;
