use ethereum_types::H256;
use sha3::{Digest, Keccak256};

/// Capability for folding two child hashes into their parent hash.
///
/// Implementations must be pure: the node engine assumes that combining the
/// same pair twice yields the same hash, and the cooperative recompute
/// protocol relies on it when a racing caller re-derives a slot.
pub trait NodeHasher: Send + Sync {
    fn combine(&self, left: &H256, right: &H256) -> H256;
}

/// Default combiner: `keccak256(left || right)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Keccak256Hasher;

impl NodeHasher for Keccak256Hasher {
    fn combine(&self, left: &H256, right: &H256) -> H256 {
        H256::from_slice(
            Keccak256::new()
                .chain_update(left)
                .chain_update(right)
                .finalize()
                .as_slice(),
        )
    }
}
