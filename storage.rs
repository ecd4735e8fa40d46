//! Reduced persistence projection of a node and its byte-level codec.
//!
//! The projection keeps everything needed to restore a node's committed
//! state: its own ledger, the 14-slot internal cache, its path, and one
//! ledger per present child. Live child objects are not carried along;
//! children are independently addressable records in the backing store.

use ethereum_types::H256;

use crate::HASH_SIZE;
use crate::error::SmtError;
use crate::internals::{INTERNAL_COUNT, NIBBLE_COUNT};
use crate::version::{VersionInfo, VersionLedger};

/// Persisted format tag of the current record layout.
const FORMAT_TAG: u8 = 0x01;

/// A child reduced to its version ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageLeafNode {
    pub versions: VersionLedger,
}

/// Persistence view of a [`TreeNode`](crate::TreeNode), produced by
/// `to_storage_tree_node` and restored with `to_tree_node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTreeNode {
    pub children: [Option<StorageLeafNode>; NIBBLE_COUNT],
    pub internals: [Option<H256>; INTERNAL_COUNT],
    pub versions: VersionLedger,
    pub path: u64,
}

impl StorageTreeNode {
    /// Serialize into `buffer` (cleared first).
    ///
    /// Layout, all integers big-endian: format tag byte, u16 children
    /// presence bitmap, u16 internals presence bitmap, u64 path, the own
    /// ledger, each present internal hash in ascending slot order, then
    /// each present child ledger in ascending nibble order. A ledger is a
    /// u32 entry count followed by fixed-width records of u64 version plus
    /// 32-byte hash.
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.clear();
        buffer.push(FORMAT_TAG);

        let mut children_bits: u16 = 0;
        for (nibble, child) in self.children.iter().enumerate() {
            if child.is_some() {
                children_bits |= 1 << nibble;
            }
        }
        let mut internal_bits: u16 = 0;
        for (idx, slot) in self.internals.iter().enumerate() {
            if slot.is_some() {
                internal_bits |= 1 << idx;
            }
        }
        buffer.extend_from_slice(&children_bits.to_be_bytes());
        buffer.extend_from_slice(&internal_bits.to_be_bytes());
        buffer.extend_from_slice(&self.path.to_be_bytes());
        encode_ledger(&self.versions, buffer);
        for hash in self.internals.iter().flatten() {
            buffer.extend_from_slice(hash.as_bytes());
        }
        for child in self.children.iter().flatten() {
            encode_ledger(&child.versions, buffer);
        }
    }

    pub fn decode(input: &[u8]) -> Result<Self, SmtError> {
        let mut reader = Reader::new(input);
        let tag = reader.take_u8()?;
        if tag != FORMAT_TAG {
            return Err(SmtError::InvalidFormat(tag));
        }
        let children_bits = reader.take_u16()?;
        let internal_bits = reader.take_u16()?;
        let path = reader.take_u64()?;
        let versions = decode_ledger(&mut reader)?;

        let mut internals = [None; INTERNAL_COUNT];
        for (idx, slot) in internals.iter_mut().enumerate() {
            if internal_bits & (1 << idx) != 0 {
                *slot = Some(reader.take_hash()?);
            }
        }
        let mut children: [Option<StorageLeafNode>; NIBBLE_COUNT] = Default::default();
        for (nibble, child) in children.iter_mut().enumerate() {
            if children_bits & (1 << nibble) != 0 {
                *child = Some(StorageLeafNode {
                    versions: decode_ledger(&mut reader)?,
                });
            }
        }
        if !reader.is_empty() {
            return Err(SmtError::TrailingInput);
        }
        Ok(Self {
            children,
            internals,
            versions,
            path,
        })
    }
}

fn encode_ledger(ledger: &VersionLedger, buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(&(ledger.len() as u32).to_be_bytes());
    for entry in ledger.entries() {
        buffer.extend_from_slice(&entry.version.to_be_bytes());
        buffer.extend_from_slice(entry.hash.as_bytes());
    }
}

fn decode_ledger(reader: &mut Reader<'_>) -> Result<VersionLedger, SmtError> {
    let count = reader.take_u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let version = reader.take_u64()?;
        let hash = reader.take_hash()?;
        entries.push(VersionInfo { version, hash });
    }
    Ok(VersionLedger::from_entries(entries))
}

struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], SmtError> {
        if self.input.len() < len {
            return Err(SmtError::TruncatedInput);
        }
        let (taken, rest) = self.input.split_at(len);
        self.input = rest;
        Ok(taken)
    }

    fn take_u8(&mut self) -> Result<u8, SmtError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, SmtError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, SmtError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_u64(&mut self) -> Result<u64, SmtError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn take_hash(&mut self) -> Result<H256, SmtError> {
        Ok(H256::from_slice(self.take(HASH_SIZE)?))
    }

    fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}
