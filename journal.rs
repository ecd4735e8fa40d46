use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::tree_node::TreeNode;
use crate::version::Version;

/// Location of a node participating in an in-flight batch of updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JournalKey {
    pub depth: u8,
    pub path: u64,
}

impl JournalKey {
    pub fn new(depth: u8, path: u64) -> Self {
        Self { depth, path }
    }

    /// Key of the node sharing this node's leaf-pair slot in the parent.
    pub fn sibling(self) -> Self {
        Self {
            depth: self.depth,
            path: self.path ^ 1,
        }
    }
}

/// Lookup contract consumed by the cooperative recompute protocol.
///
/// `None` means "no sibling participating in this batch", which is distinct
/// from "sibling exists but unchanged": untracked siblings contribute the
/// empty-subtree hash and never block propagation.
pub trait SiblingJournal: Send + Sync {
    fn get(&self, key: JournalKey) -> Option<Arc<TreeNode>>;
}

/// Reference journal: a shared map of the nodes touched by one update batch.
///
/// The orchestration layer registers every node it dirties before kicking
/// off concurrent recomputes, so that whichever sibling finishes last can
/// look the other up and complete the shared hash chain.
#[derive(Default)]
pub struct Journal {
    entries: RwLock<FxHashMap<JournalKey, Arc<TreeNode>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: JournalKey, node: Arc<TreeNode>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, node);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest version of the tracked node at `key`, if any.
    pub fn latest_version(&self, key: JournalKey) -> Option<Version> {
        let node = self.get(key)?;
        node.latest_version().ok()
    }
}

impl SiblingJournal for Journal {
    fn get(&self, key: JournalKey) -> Option<Arc<TreeNode>> {
        // A poisoned map behaves as "untracked"; the caller then combines
        // against the empty-subtree hash, which is the safe default.
        self.entries.read().ok()?.get(&key).cloned()
    }
}
