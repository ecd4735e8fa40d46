use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam::sync::WaitGroup;
use ethereum_types::H256;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::HASH_SIZE;
use crate::error::SmtError;
use crate::hasher::NodeHasher;
use crate::internals::{
    INTERNAL_COUNT, LEAF_INTERNAL_MAP, LEVELS, NIBBLE_COUNT, SlotInputs, slot_bit_level,
    slot_inputs, slot_sibling,
};
use crate::journal::{JournalKey, SiblingJournal};
use crate::nil_hashes::NilHashes;
use crate::storage::{StorageLeafNode, StorageTreeNode};
use crate::threadpool::ThreadPool;
use crate::version::{Version, VersionInfo, VersionLedger};

type ChildArray = [Option<Arc<TreeNode>>; NIBBLE_COUNT];

/// One packed internal hash cell. `hash == None` means the slot has been
/// invalidated (or archived) and not recomputed yet; `version` tags the
/// update that produced the current hash.
struct InternalSlot {
    hash: Option<H256>,
    version: Version,
}

/// State guarded by the whole-node lock: the ledger, child ownership and
/// the archived flag. The 14 internal slots sit outside it under their own
/// per-slot locks so independent ancestor chains can climb concurrently.
struct NodeState {
    children: ChildArray,
    versions: VersionLedger,
    temporary: bool,
}

/// One packed 4-level subtree of a versioned radix-16 sparse Merkle tree,
/// rooted at `(depth, path)` where `depth` counts 4-bit levels from the
/// tree root and `path` accumulates the nibble sequence down to this node.
///
/// The node owns its 16 children (absent children stand for empty subtrees)
/// and caches the 4 binary levels above them in 14 packed hash slots. Its
/// committed root lives in an append-only version ledger, which stays
/// authoritative even after the structural caches are archived away.
pub struct TreeNode {
    depth: u8,
    path: u64,
    /// Empty-subtree hash at this node's own depth.
    nil_hash: H256,
    /// Empty-subtree hash at the children's depth, used for absent children.
    nil_child_hash: H256,
    /// Empty-subtree hashes of the three packed binary levels, top-down.
    level_nils: [H256; 3],
    hasher: Arc<dyn NodeHasher>,
    state: RwLock<NodeState>,
    internals: [RwLock<InternalSlot>; INTERNAL_COUNT],
}

/// Order a freshly computed hash and its sibling by the index parity of the
/// computed side: even indices sit on the left of their pair.
fn order_pair(index: usize, own: H256, sibling: H256) -> (H256, H256) {
    if index % 2 == 0 {
        (own, sibling)
    } else {
        (sibling, own)
    }
}

impl TreeNode {
    /// Create an empty node: no versions, no children, every internal slot
    /// preloaded with the empty-subtree hash of its binary level.
    pub fn new(depth: u8, path: u64, nil_hashes: &NilHashes, hasher: Arc<dyn NodeHasher>) -> Self {
        let level_nils = [
            nil_hashes.get(depth.saturating_add(1)),
            nil_hashes.get(depth.saturating_add(2)),
            nil_hashes.get(depth.saturating_add(3)),
        ];
        Self {
            depth,
            path,
            nil_hash: nil_hashes.get(depth),
            nil_child_hash: nil_hashes.get(depth.saturating_add(4)),
            level_nils,
            hasher,
            state: RwLock::new(NodeState {
                children: Default::default(),
                versions: VersionLedger::new(),
                temporary: false,
            }),
            internals: std::array::from_fn(|idx| {
                RwLock::new(InternalSlot {
                    hash: Some(level_nils[slot_bit_level(idx) as usize - 1]),
                    version: 0,
                })
            }),
        }
    }

    /// An archived node carrying only its ledger, as restored from storage.
    fn archived(
        depth: u8,
        path: u64,
        nil_hashes: &NilHashes,
        hasher: Arc<dyn NodeHasher>,
        versions: VersionLedger,
    ) -> Self {
        let node = Self::new(depth, path, nil_hashes, hasher);
        // Fresh locks cannot be poisoned; fall back to untouched slots if
        // they somehow are.
        for idx in 0..INTERNAL_COUNT {
            if let Ok(mut slot) = node.internals[idx].write() {
                slot.hash = None;
            }
        }
        if let Ok(mut state) = node.state.write() {
            state.versions = versions;
            state.temporary = true;
        }
        node
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn path(&self) -> u64 {
        self.path
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, NodeState>, SmtError> {
        self.state.read().map_err(|_| SmtError::LockError)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, NodeState>, SmtError> {
        self.state.write().map_err(|_| SmtError::LockError)
    }

    fn slot_read(&self, idx: usize) -> Result<RwLockReadGuard<'_, InternalSlot>, SmtError> {
        self.internals[idx].read().map_err(|_| SmtError::LockError)
    }

    fn slot_write(&self, idx: usize) -> Result<RwLockWriteGuard<'_, InternalSlot>, SmtError> {
        self.internals[idx].write().map_err(|_| SmtError::LockError)
    }

    /// Latest committed root hash, or the empty-subtree hash for a node
    /// that has never been written. Self-sufficient: never walks children.
    pub fn root(&self) -> Result<H256, SmtError> {
        Ok(self
            .read_state()?
            .versions
            .latest_hash()
            .unwrap_or(self.nil_hash))
    }

    /// Latest committed version, or 0 for a never-written node.
    pub fn latest_version(&self) -> Result<Version, SmtError> {
        Ok(self.read_state()?.versions.latest_version())
    }

    /// Second-to-latest committed version, or 0 with fewer than 2 entries.
    pub fn previous_version(&self) -> Result<Version, SmtError> {
        Ok(self.read_state()?.versions.previous_version())
    }

    /// Commit a root hash directly, without touching the internal cache.
    /// Used for leaf-level nodes whose hash is decided by the caller.
    pub fn set(&self, hash: H256, version: Version) -> Result<(), SmtError> {
        self.write_state()?
            .versions
            .record(VersionInfo { version, hash });
        Ok(())
    }

    /// Attach a child without recomputing any hashes. The caller is
    /// expected to refresh the cache later, typically via the parallel
    /// batch recompute after marking the affected slots dirty.
    pub fn set_children_only(&self, child: Arc<TreeNode>, nibble: usize) -> Result<(), SmtError> {
        debug_assert!(nibble < NIBBLE_COUNT);
        self.write_state()?.children[nibble] = Some(child);
        Ok(())
    }

    pub fn get_child(&self, nibble: usize) -> Result<Option<Arc<TreeNode>>, SmtError> {
        debug_assert!(nibble < NIBBLE_COUNT);
        Ok(self.read_state()?.children[nibble].clone())
    }

    /// Sequential single-child update: attach the child, recompute exactly
    /// the three internal slots its nibble feeds, bottom-up, and mint the
    /// new root version. Holds the whole-node lock for the duration, so no
    /// partial state is ever observable.
    pub fn set_children(
        &self,
        child: Arc<TreeNode>,
        nibble: usize,
        version: Version,
    ) -> Result<(), SmtError> {
        debug_assert!(nibble < NIBBLE_COUNT);
        let mut state = self.write_state()?;
        state.children[nibble] = Some(child);

        let (mut left, mut right) = self.pair_roots(&state.children, nibble & !1)?;
        let mut slot = nibble;
        for (prefix, _) in LEVELS {
            slot /= 2;
            let idx = prefix + slot;
            let hash = self.hasher.combine(&left, &right);
            self.store_internal(idx, hash, version)?;
            let sibling = self
                .load_internal(slot_sibling(idx))?
                .unwrap_or_else(|| self.level_nil(idx));
            (left, right) = order_pair(slot, hash, sibling);
        }
        // After the top level, left/right are slots 0 and 1.
        let root = self.hasher.combine(&left, &right);
        state.versions.record(VersionInfo {
            version,
            hash: root,
        });
        Ok(())
    }

    /// Rebuild all 14 internal slots from the 16 children's current roots.
    /// A cache rebuild after bulk load, not a logical mutation: no version
    /// is minted.
    pub fn compute_internal_hash(&self) -> Result<(), SmtError> {
        let state = self.write_state()?;
        let version = state.versions.latest_version();
        for (prefix, width) in LEVELS {
            for idx in prefix..prefix + width {
                self.refresh_slot(idx, &state.children, version)?;
            }
        }
        Ok(())
    }

    /// Parallel batch recompute of the given dirty internal slots, level by
    /// level: one pool task per dirty slot, a barrier between levels (each
    /// level reads the one below), then a root version minted under the
    /// node's current latest version. Used to refresh the cache after a
    /// bulk of children changed under an already-decided version.
    pub fn compute_internal<'scope>(
        &'scope self,
        dirty: &FxHashSet<usize>,
        pool: &ThreadPool<'scope>,
    ) -> Result<(), SmtError> {
        if dirty.is_empty() {
            return Ok(());
        }
        let mut state = self.write_state()?;
        let version = state.versions.latest_version();
        // Tasks outlive this stack frame as far as the borrow checker can
        // tell, so they get their own handle on the child array.
        let children = Arc::new(state.children.clone());
        let failed = Arc::new(AtomicBool::new(false));

        for (prefix, width) in LEVELS {
            let wg = WaitGroup::new();
            for &idx in dirty {
                if idx < prefix || idx >= prefix + width {
                    continue;
                }
                let children = Arc::clone(&children);
                let failed = Arc::clone(&failed);
                let wg = wg.clone();
                pool.execute(Box::new(move || {
                    if self.refresh_slot(idx, &children, version).is_err() {
                        failed.store(true, Ordering::Relaxed);
                    }
                    drop(wg);
                }));
            }
            wg.wait();
        }
        if failed.load(Ordering::Relaxed) {
            return Err(SmtError::LockError);
        }

        let left = self.load_internal(0)?.unwrap_or_else(|| self.level_nil(0));
        let right = self.load_internal(1)?.unwrap_or_else(|| self.level_nil(1));
        let root = self.hasher.combine(&left, &right);
        state.versions.record(VersionInfo {
            version,
            hash: root,
        });
        Ok(())
    }

    /// Cross-node cooperative recompute: fold `child`'s new hash into this
    /// node's packed levels while independent callers may be climbing the
    /// same chains for the sibling leaves.
    ///
    /// Returns `Ok(false)` for "not progressed": the sibling has not
    /// reached `version` yet, or a racing caller already owns the rest of
    /// the climb. That is not an error; the protocol guarantees that the
    /// last sibling to catch up observes both halves ready at every level
    /// and completes the chain. Never blocks.
    pub fn recompute(
        &self,
        child: &TreeNode,
        journal: &dyn SiblingJournal,
        version: Version,
    ) -> Result<bool, SmtError> {
        let nibble = (child.path & 0xf) as usize;
        let own = child.root()?;
        let sibling_root = match journal.get(JournalKey::new(child.depth, child.path ^ 1)) {
            Some(sibling) => {
                if sibling.latest_version()? < version {
                    trace!(
                        depth = self.depth,
                        path = self.path,
                        nibble,
                        "sibling behind target version, yielding to its own recompute"
                    );
                    return Ok(false);
                }
                sibling.root()?
            }
            // Untracked sibling: not part of this batch, contributes its
            // empty-subtree default.
            None => self.nil_child_hash,
        };

        let (mut left, mut right) = order_pair(nibble, own, sibling_root);
        let mut slot = nibble;
        for (prefix, _) in LEVELS {
            slot /= 2;
            let idx = prefix + slot;
            let hash = match self.set_internal(idx, &left, &right, version)? {
                Some(hash) => hash,
                None => {
                    trace!(
                        depth = self.depth,
                        path = self.path,
                        idx,
                        "slot already combined by a racing caller, yielding"
                    );
                    return Ok(false);
                }
            };
            let sibling = match self.load_internal(slot_sibling(idx))? {
                Some(hash) => hash,
                None => {
                    trace!(
                        depth = self.depth,
                        path = self.path,
                        idx,
                        "sibling slot not computed yet, its branch will finish the climb"
                    );
                    return Ok(false);
                }
            };
            (left, right) = order_pair(slot, hash, sibling);
        }

        let root = self.hasher.combine(&left, &right);
        self.write_state()?.versions.record(VersionInfo {
            version,
            hash: root,
        });
        Ok(true)
    }

    /// Single-writer-wins per-slot primitive of the cooperative protocol.
    /// Returns the freshly combined hash, or `None` when a racing caller
    /// already filled the slot: the chain above it is theirs to finish.
    fn set_internal(
        &self,
        idx: usize,
        left: &H256,
        right: &H256,
        version: Version,
    ) -> Result<Option<H256>, SmtError> {
        let mut slot = self.slot_write(idx)?;
        if slot.hash.is_some() {
            return Ok(None);
        }
        let hash = self.hasher.combine(left, right);
        slot.hash = Some(hash);
        slot.version = version;
        Ok(Some(hash))
    }

    /// Current hash of a packed slot, or `None` while it is invalidated.
    /// This is the sibling-hash accessor proof assembly reads, under the
    /// same per-slot lock discipline as the recompute paths.
    pub fn internal_hash(&self, idx: usize) -> Result<Option<H256>, SmtError> {
        debug_assert!(idx < INTERNAL_COUNT);
        self.load_internal(idx)
    }

    /// Invalidate exactly the three slots fed by `nibble`, making them
    /// claimable by the cooperative protocol.
    pub fn mark(&self, nibble: usize) -> Result<(), SmtError> {
        debug_assert!(nibble < NIBBLE_COUNT);
        for &idx in &LEAF_INTERNAL_MAP[nibble] {
            self.slot_write(idx)?.hash = None;
        }
        Ok(())
    }

    /// Trim version history below the retention horizon. Returns bytes
    /// freed. See [`VersionLedger::prune`] for the exact retention rule.
    pub fn prune(&self, oldest_version: Version) -> Result<u64, SmtError> {
        Ok(self.write_state()?.versions.prune(oldest_version))
    }

    /// Undo speculative writes above `target_version`. Returns whether this
    /// node changed (for upward propagation) and the bytes freed.
    pub fn rollback(&self, target_version: Version) -> Result<(bool, u64), SmtError> {
        Ok(self.write_state()?.versions.rollback(target_version))
    }

    /// Depth-first memory bounding pass: children whose latest version
    /// predates `oldest_version` are archived (structural caches cleared,
    /// ledger kept), others are recursed into. Returns the estimated byte
    /// size of the subtree after the pass.
    pub fn release(&self, oldest_version: Version) -> Result<u64, SmtError> {
        let state = self.write_state()?;
        let mut size = Self::size_of(&state);
        for child in state.children.iter().flatten() {
            let mut child_state = child.write_state()?;
            let latest = child_state.versions.latest_version();
            if !child_state.versions.is_empty() && latest < oldest_version {
                child.archive_locked(&mut child_state)?;
                size += Self::size_of(&child_state);
                debug!(
                    depth = child.depth,
                    path = child.path,
                    latest,
                    "archived cold subtree"
                );
            } else {
                drop(child_state);
                size += child.release(oldest_version)?;
            }
        }
        Ok(size)
    }

    /// Clear the structural caches, leaving only the ledger authoritative.
    /// The node must be rebuilt from its storage projection before further
    /// structural use.
    fn archive_locked(&self, state: &mut NodeState) -> Result<(), SmtError> {
        for idx in 0..INTERNAL_COUNT {
            let mut slot = self.slot_write(idx)?;
            slot.hash = None;
            slot.version = 0;
        }
        state.children = Default::default();
        state.temporary = true;
        Ok(())
    }

    /// Whether the structural caches have been evicted. Archived nodes
    /// answer `root()` from their ledger but must be rehydrated from the
    /// backing store before any structural operation.
    pub fn is_temporary(&self) -> Result<bool, SmtError> {
        Ok(self.read_state()?.temporary)
    }

    /// Estimated in-memory footprint: the ledger's fixed-width records,
    /// plus the internal cache unless archived.
    pub fn size(&self) -> Result<u64, SmtError> {
        Ok(Self::size_of(&*self.read_state()?))
    }

    fn size_of(state: &NodeState) -> u64 {
        let ledger = state.versions.size_bytes();
        if state.temporary {
            ledger
        } else {
            ledger + (HASH_SIZE * INTERNAL_COUNT) as u64
        }
    }

    /// Reduced persistence view: own ledger, internal cache, path, and the
    /// children's ledgers only. Children are independently addressable in
    /// the backing store, so their substructure is not carried along.
    pub fn to_storage_tree_node(&self) -> Result<StorageTreeNode, SmtError> {
        let state = self.read_state()?;
        let mut children: [Option<StorageLeafNode>; NIBBLE_COUNT] = Default::default();
        for (nibble, child) in state.children.iter().enumerate() {
            if let Some(child) = child {
                children[nibble] = Some(StorageLeafNode {
                    versions: child.read_state()?.versions.clone(),
                });
            }
        }
        let mut internals = [None; INTERNAL_COUNT];
        for (idx, stored) in internals.iter_mut().enumerate() {
            *stored = self.load_internal(idx)?;
        }
        Ok(StorageTreeNode {
            children,
            internals,
            versions: state.versions.clone(),
            path: self.path,
        })
    }

    /// Snapshot clone of the node's current state, used by orchestration
    /// for multi-version tree snapshots. Children are shared, not copied.
    pub fn deep_copy(&self) -> Result<TreeNode, SmtError> {
        let state = self.read_state()?;
        let mut snapshot: [(Option<H256>, Version); INTERNAL_COUNT] =
            [(None, 0); INTERNAL_COUNT];
        for (idx, snap) in snapshot.iter_mut().enumerate() {
            let slot = self.slot_read(idx)?;
            *snap = (slot.hash, slot.version);
        }
        Ok(TreeNode {
            depth: self.depth,
            path: self.path,
            nil_hash: self.nil_hash,
            nil_child_hash: self.nil_child_hash,
            level_nils: self.level_nils,
            hasher: self.hasher.clone(),
            state: RwLock::new(NodeState {
                children: state.children.clone(),
                versions: state.versions.clone(),
                temporary: state.temporary,
            }),
            internals: std::array::from_fn(|idx| {
                RwLock::new(InternalSlot {
                    hash: snapshot[idx].0,
                    version: snapshot[idx].1,
                })
            }),
        })
    }

    /// Roots of the child pair starting at the even nibble `pair_base`;
    /// absent children contribute the empty-subtree hash.
    fn pair_roots(&self, children: &ChildArray, pair_base: usize) -> Result<(H256, H256), SmtError> {
        debug_assert!(pair_base % 2 == 0);
        let left = match &children[pair_base] {
            Some(child) => child.root()?,
            None => self.nil_child_hash,
        };
        let right = match &children[pair_base + 1] {
            Some(child) => child.root()?,
            None => self.nil_child_hash,
        };
        Ok((left, right))
    }

    /// Recompute one slot from its two inputs: child roots for the bottom
    /// level, lower slots otherwise.
    fn refresh_slot(
        &self,
        idx: usize,
        children: &ChildArray,
        version: Version,
    ) -> Result<(), SmtError> {
        let (left, right) = match slot_inputs(idx) {
            SlotInputs::Children(pair_base, _) => self.pair_roots(children, pair_base)?,
            SlotInputs::Slots(lower_left, lower_right) => (
                self.load_internal(lower_left)?
                    .unwrap_or_else(|| self.level_nil(lower_left)),
                self.load_internal(lower_right)?
                    .unwrap_or_else(|| self.level_nil(lower_right)),
            ),
        };
        let hash = self.hasher.combine(&left, &right);
        self.store_internal(idx, hash, version)
    }

    fn store_internal(&self, idx: usize, hash: H256, version: Version) -> Result<(), SmtError> {
        let mut slot = self.slot_write(idx)?;
        slot.hash = Some(hash);
        slot.version = version;
        Ok(())
    }

    fn load_internal(&self, idx: usize) -> Result<Option<H256>, SmtError> {
        Ok(self.slot_read(idx)?.hash)
    }

    /// Empty-subtree hash of the binary level `idx` sits on.
    fn level_nil(&self, idx: usize) -> H256 {
        self.level_nils[slot_bit_level(idx) as usize - 1]
    }
}

impl StorageTreeNode {
    /// Rebuild a live node from its persisted projection. Restored
    /// children carry only their ledgers and come back archived; they must
    /// be independently rehydrated from the backing store on demand.
    pub fn to_tree_node(
        &self,
        depth: u8,
        nil_hashes: &NilHashes,
        hasher: Arc<dyn NodeHasher>,
    ) -> TreeNode {
        let node = TreeNode::new(depth, self.path, nil_hashes, hasher.clone());
        for (idx, stored) in self.internals.iter().enumerate() {
            if let Ok(mut slot) = node.internals[idx].write() {
                slot.hash = *stored;
            }
        }
        if let Ok(mut state) = node.state.write() {
            state.versions = self.versions.clone();
            for (nibble, stored_child) in self.children.iter().enumerate() {
                let Some(stored_child) = stored_child else {
                    continue;
                };
                if stored_child.versions.is_empty() {
                    continue;
                }
                state.children[nibble] = Some(Arc::new(TreeNode::archived(
                    depth.saturating_add(4),
                    (self.path << 4) | nibble as u64,
                    nil_hashes,
                    hasher.clone(),
                    stored_child.versions.clone(),
                )));
            }
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VERSION_SIZE;
    use crate::hasher::Keccak256Hasher;
    use crate::journal::Journal;
    use rand::Rng;
    use std::thread;
    use std::time::Duration;

    fn hasher() -> Arc<dyn NodeHasher> {
        Arc::new(Keccak256Hasher)
    }

    fn nil_hashes() -> NilHashes {
        NilHashes::new(&Keccak256Hasher, 64, H256::zero())
    }

    fn leaf_hash(nibble: usize) -> H256 {
        H256::repeat_byte(nibble as u8 + 1)
    }

    /// Child at depth 4 under a parent at depth 0, path 0, committed at
    /// `version`.
    fn committed_child(
        nibble: usize,
        hash: H256,
        version: Version,
        nils: &NilHashes,
    ) -> Arc<TreeNode> {
        let child = Arc::new(TreeNode::new(4, nibble as u64, nils, hasher()));
        child.set(hash, version).unwrap();
        child
    }

    #[test]
    fn empty_node_root_is_the_empty_subtree_hash() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        assert_eq!(node.root().unwrap(), nils.get(0));
        let deep = TreeNode::new(8, 37, &nils, hasher());
        assert_eq!(deep.root().unwrap(), nils.get(8));
    }

    #[test]
    fn set_children_updates_exactly_one_chain() {
        let nils = nil_hashes();
        let combiner = Keccak256Hasher;
        let node = TreeNode::new(0, 0, &nils, hasher());
        let child = committed_child(3, leaf_hash(3), 1, &nils);
        node.set_children(child, 3, 1).unwrap();

        // Nibble 3 feeds slots 7, 2 and 0; every sibling along the climb is
        // still the empty-subtree hash of its level.
        let pair = combiner.combine(&nils.get(4), &leaf_hash(3));
        let parent = combiner.combine(&nils.get(3), &pair);
        let grandparent = combiner.combine(&parent, &nils.get(2));
        let root = combiner.combine(&grandparent, &nils.get(1));

        assert_eq!(node.internal_hash(7).unwrap(), Some(pair));
        assert_eq!(node.internal_hash(2).unwrap(), Some(parent));
        assert_eq!(node.internal_hash(0).unwrap(), Some(grandparent));
        assert_eq!(node.root().unwrap(), root);
        assert_eq!(node.latest_version().unwrap(), 1);
    }

    #[test]
    fn set_children_is_idempotent_per_version() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        let child = committed_child(5, leaf_hash(5), 1, &nils);
        node.set_children(child.clone(), 5, 1).unwrap();
        let first_root = node.root().unwrap();
        node.set_children(child, 5, 1).unwrap();
        assert_eq!(node.root().unwrap(), first_root);
        assert_eq!(node.read_state().unwrap().versions.len(), 1);
    }

    #[test]
    fn same_version_updates_collapse_into_one_ledger_entry() {
        // Spec'd worked example: nibble 3 then nibble 12 at the same
        // version is an overwrite, not two commits.
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        node.set_children(committed_child(3, leaf_hash(3), 1, &nils), 3, 1)
            .unwrap();
        node.set_children(committed_child(12, leaf_hash(12), 1, &nils), 12, 1)
            .unwrap();

        let state = node.read_state().unwrap();
        assert_eq!(state.versions.len(), 1);
        assert_eq!(state.versions.latest_version(), 1);
        drop(state);

        // Both children must be reflected: a from-scratch rebuild of the
        // full cache yields the same pair of top slots.
        let twin = TreeNode::new(0, 0, &nils, hasher());
        twin.set_children_only(committed_child(3, leaf_hash(3), 1, &nils), 3)
            .unwrap();
        twin.set_children_only(committed_child(12, leaf_hash(12), 1, &nils), 12)
            .unwrap();
        twin.compute_internal_hash().unwrap();
        let expected = Keccak256Hasher.combine(
            &twin.internal_hash(0).unwrap().unwrap(),
            &twin.internal_hash(1).unwrap().unwrap(),
        );
        assert_eq!(node.root().unwrap(), expected);
    }

    #[test]
    fn full_rebuild_matches_incremental_updates() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        for nibble in [0usize, 7, 8, 15] {
            node.set_children(
                committed_child(nibble, leaf_hash(nibble), 1, &nils),
                nibble,
                1,
            )
            .unwrap();
        }

        let twin = TreeNode::new(0, 0, &nils, hasher());
        for nibble in [0usize, 7, 8, 15] {
            twin.set_children_only(committed_child(nibble, leaf_hash(nibble), 1, &nils), nibble)
                .unwrap();
        }
        twin.compute_internal_hash().unwrap();

        for idx in 0..INTERNAL_COUNT {
            assert_eq!(
                node.internal_hash(idx).unwrap(),
                twin.internal_hash(idx).unwrap(),
                "slot {idx} diverges from the from-scratch rebuild"
            );
        }
        // The rebuild minted no version.
        assert!(twin.read_state().unwrap().versions.is_empty());
    }

    #[test]
    fn mark_invalidates_exactly_the_mapped_slots() {
        let nils = nil_hashes();
        for nibble in 0..NIBBLE_COUNT {
            let node = TreeNode::new(0, 0, &nils, hasher());
            node.mark(nibble).unwrap();
            for idx in 0..INTERNAL_COUNT {
                let expect_cleared = LEAF_INTERNAL_MAP[nibble].contains(&idx);
                assert_eq!(
                    node.internal_hash(idx).unwrap().is_none(),
                    expect_cleared,
                    "nibble {nibble}, slot {idx}"
                );
            }
        }
    }

    #[test]
    fn parallel_batch_recompute_matches_sequential() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        node.set(H256::zero(), 5).unwrap();

        let updated = [1usize, 9, 14];
        let mut dirty = FxHashSet::default();
        for &nibble in &updated {
            node.set_children_only(committed_child(nibble, leaf_hash(nibble), 5, &nils), nibble)
                .unwrap();
            node.mark(nibble).unwrap();
            dirty.extend(LEAF_INTERNAL_MAP[nibble]);
        }

        thread::scope(|s| {
            let pool = ThreadPool::new(4, s);
            node.compute_internal(&dirty, &pool).unwrap();
        });

        let reference = TreeNode::new(0, 0, &nils, hasher());
        for &nibble in &updated {
            reference
                .set_children(committed_child(nibble, leaf_hash(nibble), 5, &nils), nibble, 5)
                .unwrap();
        }

        assert_eq!(node.root().unwrap(), reference.root().unwrap());
        assert_eq!(node.latest_version().unwrap(), 5);
    }

    #[test]
    fn cooperative_recompute_with_untracked_sibling_matches_sequential() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        node.mark(6).unwrap();
        let child = committed_child(6, leaf_hash(6), 1, &nils);
        let journal = Journal::new();

        assert!(node.recompute(&child, &journal, 1).unwrap());

        let reference = TreeNode::new(0, 0, &nils, hasher());
        reference
            .set_children(committed_child(6, leaf_hash(6), 1, &nils), 6, 1)
            .unwrap();
        assert_eq!(node.root().unwrap(), reference.root().unwrap());
    }

    #[test]
    fn cooperative_recompute_yields_while_the_sibling_lags() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        node.mark(0).unwrap();
        node.mark(1).unwrap();

        let child = committed_child(0, leaf_hash(0), 2, &nils);
        let sibling = committed_child(1, leaf_hash(1), 1, &nils);
        let journal = Journal::new();
        journal.insert(JournalKey::new(4, 1), sibling.clone());

        // Sibling still at version 1: the caller must yield untouched.
        assert!(!node.recompute(&child, &journal, 2).unwrap());
        assert!(node.internal_hash(6).unwrap().is_none());

        // Once the sibling catches up, its own climb completes the chain.
        sibling.set(leaf_hash(1), 2).unwrap();
        journal.insert(JournalKey::new(4, 0), child.clone());
        assert!(node.recompute(&sibling, &journal, 2).unwrap());

        let reference = TreeNode::new(0, 0, &nils, hasher());
        reference.set_children(child, 0, 2).unwrap();
        reference.set_children(sibling, 1, 2).unwrap();
        assert_eq!(node.root().unwrap(), reference.root().unwrap());
    }

    #[test]
    fn concurrent_cooperative_recomputes_match_the_sequential_result() {
        let nils = nil_hashes();
        let parent = Arc::new(TreeNode::new(0, 0, &nils, hasher()));
        for nibble in 0..NIBBLE_COUNT {
            parent.mark(nibble).unwrap();
        }

        let journal = Journal::new();
        let children: Vec<Arc<TreeNode>> = (0..NIBBLE_COUNT)
            .map(|nibble| {
                let child = committed_child(nibble, leaf_hash(nibble), 1, &nils);
                journal.insert(JournalKey::new(4, nibble as u64), child.clone());
                child
            })
            .collect();

        let reference = TreeNode::new(0, 0, &nils, hasher());
        for (nibble, child) in children.iter().enumerate() {
            reference.set_children(child.clone(), nibble, 1).unwrap();
        }
        let expected = reference.root().unwrap();

        let mut completions = 0;
        thread::scope(|s| {
            let handles: Vec<_> = children
                .iter()
                .map(|child| {
                    let parent = Arc::clone(&parent);
                    let child = Arc::clone(child);
                    let journal = &journal;
                    s.spawn(move || {
                        // Randomized completion order across the 8 pairs.
                        let jitter = rand::thread_rng().gen_range(0..500);
                        thread::sleep(Duration::from_micros(jitter));
                        parent.recompute(&child, journal, 1).unwrap()
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().unwrap() {
                    completions += 1;
                }
            }
        });

        // At least one climber reaches the root; racing top-level climbers
        // may both mint the identical version entry.
        assert!(completions >= 1);
        assert_eq!(parent.root().unwrap(), expected);
        assert_eq!(parent.latest_version().unwrap(), 1);

        // Every slot was combined exactly once and matches the sequential
        // result.
        for idx in 0..INTERNAL_COUNT {
            assert_eq!(
                parent.internal_hash(idx).unwrap(),
                reference.internal_hash(idx).unwrap(),
                "slot {idx}"
            );
            assert_eq!(parent.slot_read(idx).unwrap().version, 1, "slot {idx}");
        }
        assert_eq!(parent.read_state().unwrap().versions.len(), 1);
    }

    #[test]
    fn prune_leaves_the_latest_root_untouched() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        for version in 1..=4 {
            node.set_children(
                committed_child(2, H256::repeat_byte(version as u8), version, &nils),
                2,
                version,
            )
            .unwrap();
        }
        let root = node.root().unwrap();
        let freed = node.prune(3).unwrap();
        assert_eq!(freed, 2 * VERSION_SIZE as u64);
        assert_eq!(node.root().unwrap(), root);
        assert_eq!(node.latest_version().unwrap(), 4);
    }

    #[test]
    fn rollback_then_reapply_reproduces_the_root_sequence() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        let mut roots = Vec::new();
        for version in 1..=4 {
            node.set_children(
                committed_child(9, H256::repeat_byte(version as u8), version, &nils),
                9,
                version,
            )
            .unwrap();
            roots.push(node.root().unwrap());
        }

        let (changed, freed) = node.rollback(2).unwrap();
        assert!(changed);
        assert_eq!(freed, 2 * VERSION_SIZE as u64);
        assert_eq!(node.root().unwrap(), roots[1]);
        assert_eq!(node.previous_version().unwrap(), 1);

        for version in 3..=4u64 {
            node.set_children(
                committed_child(9, H256::repeat_byte(version as u8), version, &nils),
                9,
                version,
            )
            .unwrap();
            assert_eq!(node.root().unwrap(), roots[version as usize - 1]);
        }
    }

    #[test]
    fn release_archives_only_cold_children() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        let cold = committed_child(1, leaf_hash(1), 2, &nils);
        let warm = committed_child(4, leaf_hash(4), 9, &nils);
        node.set_children(cold.clone(), 1, 2).unwrap();
        node.set_children(warm.clone(), 4, 9).unwrap();

        let size = node.release(5).unwrap();

        assert!(cold.is_temporary().unwrap());
        assert!(!warm.is_temporary().unwrap());
        assert!(cold.internal_hash(6).unwrap().is_none());
        // The cold child still answers root queries from its ledger.
        assert_eq!(cold.root().unwrap(), leaf_hash(1));

        let expected =
            node.size().unwrap() + cold.size().unwrap() + warm.size().unwrap();
        assert_eq!(size, expected);
        assert_eq!(cold.size().unwrap(), VERSION_SIZE as u64);
    }

    #[test]
    fn storage_round_trip_preserves_ledgers_and_cache() {
        let nils = nil_hashes();
        let node = TreeNode::new(4, 11, &nils, hasher());
        let child_a = Arc::new(TreeNode::new(8, 11 << 4, &nils, hasher()));
        child_a.set(leaf_hash(0), 1).unwrap();
        child_a.set(leaf_hash(2), 3).unwrap();
        let child_b = Arc::new(TreeNode::new(8, (11 << 4) | 13, &nils, hasher()));
        child_b.set(leaf_hash(13), 3).unwrap();
        node.set_children(child_a.clone(), 0, 1).unwrap();
        node.set_children(child_b.clone(), 13, 3).unwrap();

        let stored = node.to_storage_tree_node().unwrap();
        let mut buffer = Vec::new();
        stored.encode(&mut buffer);
        let decoded = StorageTreeNode::decode(&buffer).unwrap();
        assert_eq!(decoded, stored);

        let restored = decoded.to_tree_node(4, &nils, hasher());
        assert_eq!(restored.path(), 11);
        assert_eq!(restored.root().unwrap(), node.root().unwrap());
        for idx in 0..INTERNAL_COUNT {
            assert_eq!(
                restored.internal_hash(idx).unwrap(),
                node.internal_hash(idx).unwrap()
            );
        }

        let restored_a = restored.get_child(0).unwrap().unwrap();
        assert!(restored_a.is_temporary().unwrap());
        assert_eq!(restored_a.root().unwrap(), child_a.root().unwrap());
        assert_eq!(restored_a.previous_version().unwrap(), 1);
        assert!(restored.get_child(5).unwrap().is_none());
    }

    #[test]
    fn archival_is_transparent_to_the_storage_projection() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        let child = committed_child(7, leaf_hash(7), 1, &nils);
        node.set_children(child.clone(), 7, 1).unwrap();
        node.release(10).unwrap();
        assert!(child.is_temporary().unwrap());

        let stored = node.to_storage_tree_node().unwrap();
        let mut buffer = Vec::new();
        stored.encode(&mut buffer);
        let restored = StorageTreeNode::decode(&buffer)
            .unwrap()
            .to_tree_node(0, &nils, hasher());

        let restored_child = restored.get_child(7).unwrap().unwrap();
        assert_eq!(
            restored_child.read_state().unwrap().versions,
            child.read_state().unwrap().versions
        );
    }

    #[test]
    fn deep_copy_detaches_from_later_writes() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        node.set_children(committed_child(2, leaf_hash(2), 1, &nils), 2, 1)
            .unwrap();
        let snapshot = node.deep_copy().unwrap();

        node.set_children(committed_child(3, leaf_hash(3), 2, &nils), 3, 2)
            .unwrap();

        assert_eq!(snapshot.latest_version().unwrap(), 1);
        assert_ne!(snapshot.root().unwrap(), node.root().unwrap());
        assert!(snapshot.get_child(3).unwrap().is_none());
    }

    #[test]
    fn size_reflects_the_archived_state() {
        let nils = nil_hashes();
        let node = TreeNode::new(0, 0, &nils, hasher());
        node.set(leaf_hash(0), 1).unwrap();
        node.set(leaf_hash(1), 2).unwrap();
        assert_eq!(
            node.size().unwrap(),
            (2 * VERSION_SIZE + INTERNAL_COUNT * HASH_SIZE) as u64
        );
    }
}
