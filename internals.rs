//! Index arithmetic for the packed internal cache.
//!
//! A node stores the 4 binary levels above its 16 children in a heap-like
//! 14-slot array: slots 6..14 hold the 8 leaf-pair hashes, 2..6 their 4
//! parents and 0..2 the 2 grandparents. The node root is
//! `combine(slot 0, slot 1)` and lives in the version ledger, not in a slot.

/// Children per node (one per nibble).
pub const NIBBLE_COUNT: usize = 16;
/// Packed internal hash slots per node.
pub const INTERNAL_COUNT: usize = 14;

/// `(prefix, width)` of each packed binary level, bottom-up: leaf pairs,
/// their parents, then the grandparents.
pub(crate) const LEVELS: [(usize, usize); 3] = [(6, 8), (2, 4), (0, 2)];

/// For each nibble, the exact internal slots its hash feeds, top-down:
/// grandparent, parent, leaf-pair slot. Invalidating a child invalidates
/// exactly this chain and nothing else.
pub const LEAF_INTERNAL_MAP: [[usize; 3]; NIBBLE_COUNT] = [
    [0, 2, 6],
    [0, 2, 6],
    [0, 2, 7],
    [0, 2, 7],
    [0, 3, 8],
    [0, 3, 8],
    [0, 3, 9],
    [0, 3, 9],
    [1, 4, 10],
    [1, 4, 10],
    [1, 4, 11],
    [1, 4, 11],
    [1, 5, 12],
    [1, 5, 12],
    [1, 5, 13],
    [1, 5, 13],
];

/// The slot combined with `idx` to form their common parent. Works because
/// every level prefix is even, so pair members differ only in the low bit.
pub(crate) fn slot_sibling(idx: usize) -> usize {
    idx ^ 1
}

/// How many binary levels below the node top a slot sits (1 to 3).
pub(crate) fn slot_bit_level(idx: usize) -> u8 {
    match idx {
        0..=1 => 1,
        2..=5 => 2,
        _ => 3,
    }
}

/// The two inputs feeding an internal slot.
pub(crate) enum SlotInputs {
    /// Bottom level: a pair of child nibbles.
    Children(usize, usize),
    /// Upper levels: a pair of lower internal slots.
    Slots(usize, usize),
}

pub(crate) fn slot_inputs(idx: usize) -> SlotInputs {
    debug_assert!(idx < INTERNAL_COUNT);
    if idx >= 6 {
        let base = (idx - 6) * 2;
        SlotInputs::Children(base, base + 1)
    } else {
        let lower = idx * 2 + 2;
        SlotInputs::Slots(lower, lower + 1)
    }
}
