use ethereum_types::H256;

use crate::VERSION_SIZE;

/// Monotonically increasing tag for a committed root hash.
pub type Version = u64;

/// One committed `(version, root hash)` pair. Immutable once recorded;
/// the ledger replaces the whole entry when the same version is re-minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Version,
    pub hash: H256,
}

/// Append-only, prunable, rollback-able sequence of committed root hashes.
///
/// Entries are sorted ascending by version with unique version keys; the
/// last entry is the current committed root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionLedger {
    entries: Vec<VersionInfo>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<VersionInfo>) -> Self {
        debug_assert!(
            entries.windows(2).all(|w| w[0].version < w[1].version),
            "ledger entries must be sorted ascending with unique versions"
        );
        Self { entries }
    }

    /// Commit a root hash. A version equal to the current latest overwrites
    /// it in place, which makes retried recomputes for the same version
    /// idempotent. Versions must otherwise be applied in ascending order.
    pub fn record(&mut self, info: VersionInfo) {
        if let Some(last) = self.entries.last_mut() {
            debug_assert!(
                info.version >= last.version,
                "version {} regresses behind {}",
                info.version,
                last.version
            );
            if last.version == info.version {
                *last = info;
                return;
            }
        }
        self.entries.push(info);
    }

    /// Hash of the latest committed version, if any.
    pub fn latest_hash(&self) -> Option<H256> {
        self.entries.last().map(|info| info.hash)
    }

    /// Latest committed version, or 0 for an empty ledger.
    pub fn latest_version(&self) -> Version {
        self.entries.last().map_or(0, |info| info.version)
    }

    /// Second-to-latest committed version, or 0 with fewer than 2 entries.
    pub fn previous_version(&self) -> Version {
        if self.entries.len() <= 1 {
            return 0;
        }
        self.entries[self.entries.len() - 2].version
    }

    /// Drop entries strictly older than the newest entry still below
    /// `oldest`, always retaining one entry at or before the horizon so
    /// historical "root at or before version V" queries keep an answer.
    /// Returns the bytes freed. No-op with one entry or fewer.
    pub fn prune(&mut self, oldest: Version) -> u64 {
        if self.entries.len() <= 1 {
            return 0;
        }
        let mut i = 0;
        while i < self.entries.len() - 1 && self.entries[i].version < oldest {
            i += 1;
        }
        let origin = self.entries.len();
        let keep_from = if i > 0 && self.entries[i].version > oldest {
            i - 1
        } else {
            i
        };
        self.entries.drain(..keep_from);
        ((origin - self.entries.len()) * VERSION_SIZE) as u64
    }

    /// Drop entries with a version strictly greater than `target`. Returns
    /// whether anything was dropped (so callers can propagate "did this
    /// subtree change") plus the bytes freed. No-op on an empty ledger.
    pub fn rollback(&mut self, target: Version) -> (bool, u64) {
        if self.entries.is_empty() {
            return (false, 0);
        }
        let origin = self.entries.len();
        let keep = self.entries.partition_point(|e| e.version <= target);
        self.entries.truncate(keep);
        let removed = origin - keep;
        (removed > 0, (removed * VERSION_SIZE) as u64)
    }

    pub fn size_bytes(&self) -> u64 {
        (self.entries.len() * VERSION_SIZE) as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VersionInfo] {
        &self.entries
    }
}
