use ethereum_types::H256;

use crate::hasher::NodeHasher;

/// Precomputed hashes of all-empty subtrees, indexed by bit depth.
///
/// `get(d)` is the root hash of an empty subtree whose top sits `d` binary
/// levels below the tree root. The table is derived from the combiner so
/// that `get(d) == combine(get(d + 1), get(d + 1))` holds for every level.
pub struct NilHashes {
    hashes: Vec<H256>,
}

impl NilHashes {
    /// Build the table bottom-up from the empty-leaf hash at `max_depth`.
    pub fn new(hasher: &dyn NodeHasher, max_depth: u8, nil_leaf: H256) -> Self {
        let mut hashes = vec![nil_leaf; max_depth as usize + 1];
        for depth in (0..max_depth as usize).rev() {
            hashes[depth] = hasher.combine(&hashes[depth + 1], &hashes[depth + 1]);
        }
        Self { hashes }
    }

    /// Empty-subtree hash at the given bit depth. Depths below the table
    /// clamp to the empty-leaf hash; they only occur for the placeholder
    /// children of bottom-most archived nodes, which are never combined.
    pub fn get(&self, depth: u8) -> H256 {
        let idx = (depth as usize).min(self.hashes.len() - 1);
        self.hashes[idx]
    }

    pub fn max_depth(&self) -> u8 {
        (self.hashes.len() - 1) as u8
    }
}
